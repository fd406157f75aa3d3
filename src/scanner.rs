use crate::cache::AddressCache;
use crate::netdetect::{self, LocalNetwork};
use crate::probe::Prober;
use crate::types::{ScanOutcome, ScanRange, ScanReport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid subnet prefix {0:?} (expected e.g. \"192.168.1.\")")]
    InvalidPrefix(String),
    #[error("network is down")]
    NetworkDown,
    #[error("no local IPv4 address")]
    NoLocalAddress,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Number of concurrent workers, one per host range.
    pub workers: usize,
    /// Pause after each probe inside a worker.
    pub inter_probe_delay: Duration,
    /// Pause between launching consecutive workers.
    pub worker_stagger: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            workers: 3,
            inter_probe_delay: Duration::from_millis(5),
            worker_stagger: Duration::from_millis(50),
        }
    }
}

/// Per-scan record of the accepted address. The first match claims the slot;
/// later matches are only recorded.
#[derive(Debug, Default)]
struct ScanClaim {
    accepted: Option<String>,
    matches: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Claim {
    First,
    Duplicate,
    Ignored(String),
}

impl ScanClaim {
    fn claim(&mut self, address: &str) -> Claim {
        if !self.matches.iter().any(|m| m == address) {
            self.matches.push(address.to_string());
        }
        match &self.accepted {
            None => {
                self.accepted = Some(address.to_string());
                Claim::First
            }
            Some(held) if held == address => Claim::Duplicate,
            Some(held) => Claim::Ignored(held.clone()),
        }
    }
}

/// Subnet discovery over a [`Prober`], persisting matches into an [`AddressCache`].
///
/// Only one scan or cache validation runs at a time; callers queue on an internal lock.
pub struct Scanner {
    prober: Arc<dyn Prober>,
    cache: Arc<dyn AddressCache>,
    settings: ScanSettings,
    scan_lock: tokio::sync::Mutex<()>,
}

impl Scanner {
    pub fn new(
        prober: Arc<dyn Prober>,
        cache: Arc<dyn AddressCache>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            prober,
            cache,
            settings,
            scan_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &Arc<dyn AddressCache> {
        &self.cache
    }

    /// Probe a previously cached address once, without racing a running scan.
    pub async fn validate_cached(&self, address: &str) -> bool {
        let _guard = self.scan_lock.lock().await;
        let ok = self.prober.probe(address).await;
        info!(address, valid = ok, "validated cached hub address");
        ok
    }

    /// Scan the /24 of the local interface. Refuses to start while the network is down.
    pub async fn scan_local<F>(
        &self,
        network: &dyn LocalNetwork,
        on_result: F,
    ) -> Result<ScanReport, ScanError>
    where
        F: Fn(&ScanOutcome) + Send + Sync + 'static,
    {
        if !network.is_up() {
            return Err(ScanError::NetworkDown);
        }
        let ip = network.local_ipv4().ok_or(ScanError::NoLocalAddress)?;
        self.scan(&netdetect::subnet_prefix(ip), on_result).await
    }

    /// Probe hosts 1..=254 of `prefix` (e.g. `"192.168.1."`) across concurrent workers.
    ///
    /// Every probed address is reported through `on_result`. The first match is
    /// written to the cache exactly once; later matches only show up in the report.
    /// Waits for all workers before returning, even once a match is known.
    pub async fn scan<F>(&self, prefix: &str, on_result: F) -> Result<ScanReport, ScanError>
    where
        F: Fn(&ScanOutcome) + Send + Sync + 'static,
    {
        if netdetect::parse_prefix(prefix).is_none() {
            return Err(ScanError::InvalidPrefix(prefix.to_string()));
        }

        let _guard = self.scan_lock.lock().await;
        let ranges = ScanRange::partition(self.settings.workers);
        info!(prefix, workers = ranges.len(), "starting subnet scan");

        let on_result = Arc::new(on_result);
        let claim = Arc::new(Mutex::new(ScanClaim::default()));
        let probed = Arc::new(AtomicU64::new(0));
        let mut set = JoinSet::new();

        for (idx, range) in ranges.into_iter().enumerate() {
            if idx > 0 && !self.settings.worker_stagger.is_zero() {
                time::sleep(self.settings.worker_stagger).await;
            }
            debug!(
                worker = idx,
                start = %netdetect::host_address(prefix, range.start_host),
                end = %netdetect::host_address(prefix, range.end_host),
                "launching scan worker"
            );
            let worker = ScanWorker {
                id: idx,
                prefix: prefix.to_string(),
                range,
                delay: self.settings.inter_probe_delay,
                prober: self.prober.clone(),
                cache: self.cache.clone(),
                claim: claim.clone(),
                probed: probed.clone(),
            };
            let on_result = on_result.clone();
            set.spawn(async move { worker.run(on_result.as_ref()).await });
        }

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!("scan worker aborted: {e}");
            }
        }

        let (matches, persisted) = match claim.lock() {
            Ok(c) => (c.matches.clone(), c.accepted.clone()),
            Err(poisoned) => {
                let c = poisoned.into_inner();
                (c.matches.clone(), c.accepted.clone())
            }
        };
        let report = ScanReport {
            probed: probed.load(Ordering::Relaxed),
            matches,
            persisted,
        };
        match &report.persisted {
            Some(addr) => info!(prefix, address = %addr, found = report.matches.len(), "scan complete"),
            None => info!(prefix, probed = report.probed, "scan complete, no hub found"),
        }
        Ok(report)
    }
}

struct ScanWorker {
    id: usize,
    prefix: String,
    range: ScanRange,
    delay: Duration,
    prober: Arc<dyn Prober>,
    cache: Arc<dyn AddressCache>,
    claim: Arc<Mutex<ScanClaim>>,
    probed: Arc<AtomicU64>,
}

impl ScanWorker {
    async fn run<F>(self, on_result: &F)
    where
        F: Fn(&ScanOutcome) + ?Sized,
    {
        for host in self.range.hosts() {
            let address = netdetect::host_address(&self.prefix, host);
            let matched = self.prober.probe(&address).await;
            self.probed.fetch_add(1, Ordering::Relaxed);
            if matched {
                self.accept(&address).await;
            }
            on_result(&ScanOutcome::new(address, matched));
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
        }
        debug!(worker = self.id, "scan worker finished");
    }

    async fn accept(&self, address: &str) {
        let claim = {
            let mut guard = match self.claim.lock() {
                Ok(c) => c,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.claim(address)
        };
        match claim {
            Claim::First => {
                info!(address, "hub found");
                // Only the first claim reaches here, so saves cannot interleave.
                let cache = self.cache.clone();
                let addr = address.to_string();
                if let Err(e) = tokio::task::spawn_blocking(move || cache.save(&addr)).await {
                    warn!(address, "address cache write aborted: {e}");
                }
            }
            Claim::Duplicate => debug!(address, "hub matched again"),
            Claim::Ignored(held) => {
                warn!(address, keeping = %held, "second hub on the subnet, keeping the first");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryAddressCache;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct SetProber(HashSet<String>);

    #[async_trait]
    impl Prober for SetProber {
        async fn probe(&self, address: &str) -> bool {
            self.0.contains(address)
        }
    }

    fn fast() -> ScanSettings {
        ScanSettings {
            workers: 3,
            inter_probe_delay: Duration::ZERO,
            worker_stagger: Duration::ZERO,
        }
    }

    #[test]
    fn claim_transitions() {
        let mut c = ScanClaim::default();
        assert_eq!(c.claim("a"), Claim::First);
        assert_eq!(c.claim("a"), Claim::Duplicate);
        assert_eq!(c.claim("b"), Claim::Ignored("a".into()));
        assert_eq!(c.accepted.as_deref(), Some("a"));
        assert_eq!(c.matches, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn invalid_prefix_fails_fast() {
        let cache = Arc::new(MemoryAddressCache::new());
        let scanner = Scanner::new(Arc::new(SetProber(HashSet::new())), cache, fast());
        let err = scanner.scan("not-a-prefix", |_| {}).await.unwrap_err();
        assert_eq!(err, ScanError::InvalidPrefix("not-a-prefix".into()));
        assert!(scanner.scan("", |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn local_scan_refuses_when_offline() {
        use crate::netdetect::StaticNetwork;
        use std::net::Ipv4Addr;

        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        let scanner = Scanner::new(
            Arc::new(SetProber(HashSet::new())),
            Arc::new(MemoryAddressCache::new()),
            fast(),
        );
        let err = scanner
            .scan_local(&StaticNetwork::down(), move |_| {
                sink.fetch_add(1, Ordering::Relaxed);
            })
            .await
            .unwrap_err();
        assert_eq!(err, ScanError::NetworkDown);
        assert_eq!(seen.load(Ordering::Relaxed), 0);

        let report = scanner
            .scan_local(&StaticNetwork::up(Ipv4Addr::new(10, 1, 2, 3)), |_| {})
            .await
            .unwrap();
        assert_eq!(report.probed, 254);
    }

    #[tokio::test]
    async fn cache_write_runs_off_the_runtime_thread() {
        struct ThreadRecorder(Mutex<Option<std::thread::ThreadId>>);

        impl AddressCache for ThreadRecorder {
            fn load(&self) -> Option<String> {
                None
            }

            fn save(&self, _address: &str) {
                *self.0.lock().unwrap() = Some(std::thread::current().id());
            }
        }

        let cache = Arc::new(ThreadRecorder(Mutex::new(None)));
        let hubs = HashSet::from(["10.9.8.7".to_string()]);
        let scanner = Scanner::new(Arc::new(SetProber(hubs)), cache.clone(), fast());
        scanner.scan("10.9.8.", |_| {}).await.unwrap();

        let writer = cache.0.lock().unwrap().expect("address saved");
        assert_ne!(writer, std::thread::current().id());
    }

    #[tokio::test]
    async fn every_host_reported_once() {
        let cache = Arc::new(MemoryAddressCache::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let scanner = Scanner::new(Arc::new(SetProber(HashSet::new())), cache.clone(), fast());
        let report = scanner
            .scan("10.9.8.", move |o| sink.lock().unwrap().push(o.address.clone()))
            .await
            .unwrap();
        assert_eq!(report.probed, 254);
        assert!(report.persisted.is_none());
        assert_eq!(cache.load(), None);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 254);
    }
}
