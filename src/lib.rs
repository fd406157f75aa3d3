//! Library crate for ionbridge-monitor: hub discovery and telemetry polling.
pub mod cache;
pub mod config;
pub mod failures;
pub mod feed;
pub mod metrics;
pub mod netdetect;
pub mod poller;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod types;
