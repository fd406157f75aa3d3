//! Discovery-then-poll loop that keeps the [`PowerModel`] current.
//!
//! The poller owns all mutable telemetry state. Consumers observe it through
//! `watch` channels (latest model and status) and a `broadcast` channel of
//! discovery outcomes; nothing is shared through globals.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::failures::{FailurePolicy, FailureTracker};
use crate::feed::{feed_url, FeedClient, FetchError};
use crate::metrics;
use crate::netdetect::LocalNetwork;
use crate::scanner::Scanner;
use crate::types::{now_rfc3339, PollerState, PollerStatus, PowerModel, ScanOutcome};

/// Polling never runs faster than this, whatever the configuration says.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timer jitter tolerated when deciding whether a full interval has passed.
const TICK_SLACK: Duration = Duration::from_millis(20);

/// Minimum spacing of "fetch interval drifted" warnings.
const DRIFT_LOG_EVERY: Duration = Duration::from_secs(1);

const DISCOVERY_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub feed_port: u16,
    pub feed_path: String,
    /// Address used when discovery finds nothing.
    pub default_address: String,
    pub failure_policy: FailurePolicy,
}

impl PollerConfig {
    /// Configured interval raised to [`MIN_POLL_INTERVAL`].
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_POLL_INTERVAL)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: MIN_POLL_INTERVAL,
            feed_port: 80,
            feed_path: "/metrics".into(),
            default_address: "192.168.1.19".into(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Suspends polling and discovery without dropping accumulated state,
/// e.g. while a foreground configuration screen owns the device.
#[derive(Debug, Clone, Default)]
pub struct PauseGate(Arc<AtomicBool>);

impl PauseGate {
    pub fn pause(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct TelemetryPoller {
    config: PollerConfig,
    scanner: Arc<Scanner>,
    feed: Box<dyn FeedClient>,
    network: Arc<dyn LocalNetwork>,
    state: PollerState,
    address: Option<String>,
    model: PowerModel,
    failures: FailureTracker,
    last_error: Option<String>,
    last_attempt: Option<Instant>,
    last_success: Option<Instant>,
    last_drift_log: Option<Instant>,
    model_tx: watch::Sender<PowerModel>,
    status_tx: watch::Sender<PollerStatus>,
    discovery_tx: broadcast::Sender<ScanOutcome>,
    pause: PauseGate,
}

impl TelemetryPoller {
    pub fn new(
        config: PollerConfig,
        scanner: Arc<Scanner>,
        feed: Box<dyn FeedClient>,
        network: Arc<dyn LocalNetwork>,
    ) -> Self {
        let (model_tx, _) = watch::channel(PowerModel::new());
        let (status_tx, _) = watch::channel(PollerStatus::default());
        let (discovery_tx, _) = broadcast::channel(DISCOVERY_CHANNEL_CAPACITY);
        let failures = FailureTracker::new(config.failure_policy);
        Self {
            config,
            scanner,
            feed,
            network,
            state: PollerState::Idle,
            address: None,
            model: PowerModel::new(),
            failures,
            last_error: None,
            last_attempt: None,
            last_success: None,
            last_drift_log: None,
            model_tx,
            status_tx,
            discovery_tx,
            pause: PauseGate::default(),
        }
    }

    /// Latest model, updated after every poll cycle whether it succeeded or not.
    pub fn subscribe(&self) -> watch::Receiver<PowerModel> {
        self.model_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<PollerStatus> {
        self.status_tx.subscribe()
    }

    /// Every address probed during discovery, plus validated cache hits.
    pub fn subscribe_discovery(&self) -> broadcast::Receiver<ScanOutcome> {
        self.discovery_tx.subscribe()
    }

    pub fn pause_gate(&self) -> PauseGate {
        self.pause.clone()
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn model(&self) -> &PowerModel {
        &self.model
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.consecutive()
    }

    /// Drive the poller until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let interval = self.config.effective_interval();
        info!(interval_ms = interval.as_millis() as u64, "telemetry poller started");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("telemetry poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // A discovery scan can take tens of seconds; do not make shutdown wait for it.
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("telemetry poller stopping mid-cycle");
                            break;
                        }
                        _ = self.step() => {}
                    }
                }
            }
        }
    }

    /// One timer tick: discover if needed, otherwise poll once the interval has passed.
    pub async fn step(&mut self) {
        if self.pause.is_paused() {
            trace!("poller paused");
            return;
        }
        if !self.network.is_up() {
            trace!("network down, skipping tick");
            return;
        }
        match self.state {
            PollerState::Idle | PollerState::Discovering => {
                self.discover().await;
            }
            PollerState::Polling => {
                if self.interval_elapsed() {
                    self.warn_on_drift();
                    let _ = self.poll_once().await;
                }
            }
        }
    }

    /// Establish the hub address: cached and still valid, else found by scanning,
    /// else the cached address anyway, else the configured default. Always ends in
    /// [`PollerState::Polling`].
    pub async fn discover(&mut self) -> String {
        self.set_state(PollerState::Discovering);

        let cached = self.scanner.cache().load();
        match &cached {
            Some(addr) => {
                if self.scanner.validate_cached(addr).await {
                    let _ = self.discovery_tx.send(ScanOutcome::new(addr.clone(), true));
                    return self.start_polling(addr.clone());
                }
                warn!(address = %addr, "cached hub address no longer answers, rescanning");
            }
            None => info!("no cached hub address, scanning"),
        }

        let tx = self.discovery_tx.clone();
        match self
            .scanner
            .scan_local(self.network.as_ref(), move |outcome| {
                let _ = tx.send(outcome.clone());
            })
            .await
        {
            Ok(report) => {
                if let Some(found) = report.persisted {
                    return self.start_polling(found);
                }
            }
            Err(e) => warn!("discovery scan not started: {e}"),
        }

        match cached {
            Some(addr) => {
                warn!(address = %addr, "no hub found, keeping the cached address");
                self.start_polling(addr)
            }
            None => {
                let fallback = self.config.default_address.clone();
                warn!(address = %fallback, "no hub found, polling default address");
                self.start_polling(fallback)
            }
        }
    }

    /// Fetch, parse and publish once. Failures only flip `data_valid`; previous
    /// readings are kept.
    pub async fn poll_once(&mut self) -> Result<(), FetchError> {
        let address = self
            .address
            .clone()
            .unwrap_or_else(|| self.config.default_address.clone());
        let url = feed_url(&address, self.config.feed_port, &self.config.feed_path);
        self.last_attempt = Some(Instant::now());

        let result = match self.feed.fetch(&url).await {
            Ok(body) => {
                let readings = metrics::parse(&body);
                if readings.skipped_lines > 0 {
                    trace!(skipped = readings.skipped_lines, "ignored feed lines");
                }
                if readings.is_empty() {
                    Err(FetchError::EmptyPayload)
                } else {
                    Ok(readings)
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(readings) => {
                let mut next = self.model.clone();
                readings.fold_into(&mut next);
                next.data_valid = true;
                next.updated_at = Some(now_rfc3339());
                self.model = next;

                if self.failures.consecutive() > 0 {
                    info!(address = %address, "feed recovered");
                }
                self.failures.mark_success();
                self.last_error = None;
                self.last_success = self.last_attempt;
                trace!(total_watts = self.model.total_watts, "telemetry updated");
                self.publish();
                Ok(())
            }
            Err(e) => {
                let action = self.failures.mark_failure(&e);
                let failures = self.failures.consecutive();
                self.model.data_valid = false;
                if failures == 1 {
                    warn!(address = %address, "feed fetch failed: {e}");
                } else {
                    debug!(address = %address, failures, "feed fetch failed: {e}");
                }
                if action.reset_client {
                    debug!("resetting feed client");
                    self.feed.reset();
                }
                if action.rediscover {
                    warn!(failures, "feed unreachable, re-running discovery");
                    self.state = PollerState::Discovering;
                }
                self.last_error = Some(e.to_string());
                self.publish();
                Err(e)
            }
        }
    }

    fn start_polling(&mut self, address: String) -> String {
        if self.address.as_deref() != Some(address.as_str()) {
            self.feed.reset();
        }
        info!(address = %address, "polling hub");
        self.address = Some(address.clone());
        self.failures.mark_success();
        self.last_attempt = None;
        self.set_state(PollerState::Polling);
        address
    }

    fn set_state(&mut self, state: PollerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "poller state change");
        }
        self.state = state;
        self.publish_status();
    }

    fn interval_elapsed(&self) -> bool {
        let interval = self.config.effective_interval();
        self.last_attempt
            .map_or(true, |t| t.elapsed() + TICK_SLACK >= interval)
    }

    fn warn_on_drift(&mut self) {
        let Some(last) = self.last_success else {
            return;
        };
        let gap = last.elapsed();
        if gap <= self.config.effective_interval() * 2 {
            return;
        }
        if self
            .last_drift_log
            .is_some_and(|t| t.elapsed() < DRIFT_LOG_EVERY)
        {
            return;
        }
        self.last_drift_log = Some(Instant::now());
        warn!(
            gap_ms = gap.as_millis() as u64,
            expected_ms = self.config.effective_interval().as_millis() as u64,
            "time since last good fetch exceeds twice the interval"
        );
    }

    fn publish(&self) {
        self.model_tx.send_replace(self.model.clone());
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(PollerStatus {
            state: self.state,
            address: self.address.clone(),
            consecutive_failures: self.failures.consecutive(),
            last_error: self.last_error.clone(),
        });
    }
}
