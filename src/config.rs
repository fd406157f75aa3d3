use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::failures::FailurePolicy;
use crate::poller::PollerConfig;
use crate::probe::{ProbeSettings, DEFAULT_SIGNATURE};
use crate::scanner::ScanSettings;

/// Runtime settings. Every field has a default, so a config file may list
/// only the keys it wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed_port: u16,
    pub feed_path: String,
    pub default_address: String,
    pub signature: String,
    pub poll_interval_ms: u64,
    pub fetch_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_response_bytes: usize,
    pub probe_attempts: u32,
    pub scan_workers: usize,
    pub inter_probe_delay_ms: u64,
    pub worker_stagger_ms: u64,
    pub client_reset_after: u32,
    pub rediscover_after: u32,
    pub cache_path: Option<PathBuf>,
    pub status_bind: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_port: 80,
            feed_path: "/metrics".into(),
            default_address: "192.168.1.19".into(),
            signature: DEFAULT_SIGNATURE.into(),
            poll_interval_ms: 500,
            fetch_timeout_ms: 1000,
            connect_timeout_ms: 500,
            read_timeout_ms: 1000,
            max_response_bytes: 2048,
            probe_attempts: 1,
            scan_workers: 3,
            inter_probe_delay_ms: 5,
            worker_stagger_ms: 50,
            client_reset_after: 5,
            rediscover_after: 10,
            cache_path: Some(PathBuf::from("ionbridge-cache.json")),
            status_bind: None,
        }
    }
}

impl Config {
    /// Parse a JSON config document.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(s).context("invalid config JSON")?;
        Ok(cfg)
    }

    /// Load a config file. Errors if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.as_ref().display()))
    }

    /// Load a config file, or return defaults if none was given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            port: self.feed_port,
            path: self.feed_path.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            max_response_bytes: self.max_response_bytes.clamp(256, 64 * 1024),
            attempts: self.probe_attempts.clamp(1, 3),
            signature: self.signature.clone(),
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            workers: self.scan_workers.clamp(1, 16),
            inter_probe_delay: Duration::from_millis(self.inter_probe_delay_ms),
            worker_stagger: Duration::from_millis(self.worker_stagger_ms),
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            feed_port: self.feed_port,
            feed_path: self.feed_path.clone(),
            default_address: self.default_address.clone(),
            failure_policy: FailurePolicy {
                client_reset_after: self.client_reset_after,
                rediscover_after: self.rediscover_after,
            },
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
