use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ionbridge_monitor::cache::{AddressCache, FileAddressCache, MemoryAddressCache};
use ionbridge_monitor::config::Config;
use ionbridge_monitor::feed::HttpFeedClient;
use ionbridge_monitor::netdetect::{self, InterfaceNetwork, LocalNetwork};
use ionbridge_monitor::poller::TelemetryPoller;
use ionbridge_monitor::probe::HttpProber;
use ionbridge_monitor::scanner::Scanner;
use ionbridge_monitor::server::{self, AppState};
use ionbridge_monitor::types::{PowerModel, ScanReport};

/// ionbridge-monitor: finds an IonBridge hub on the local /24 and polls its per-port power feed.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ionbridge-monitor",
    version,
    about = "Finds an IonBridge hub on the local /24 and polls its per-port power feed.",
    long_about = None
)]
struct Cli {
    /// JSON config file. Missing keys fall back to built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to poll when discovery finds nothing.
    #[arg(long = "default-address")]
    default_address: Option<String>,

    /// File holding the last confirmed hub address.
    #[arg(long = "cache-path")]
    cache_path: Option<PathBuf>,

    /// Poll interval in milliseconds (never below 500).
    #[arg(long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Serve the read-only status API.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Bind address for the status API.
    #[arg(long)]
    bind: Option<String>,

    /// Run discovery once, print what was found, and exit.
    #[arg(long = "scan-only", default_value_t = false)]
    scan_only: bool,

    /// Write the scan report as pretty JSON to this path (with --scan-only).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print a port table on every model update.
    #[arg(long, default_value_t = false)]
    print: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(a) = &self.default_address {
            cfg.default_address = a.clone();
        }
        if let Some(p) = &self.cache_path {
            cfg.cache_path = Some(p.clone());
        }
        if let Some(ms) = self.interval_ms {
            cfg.poll_interval_ms = ms;
        }
        if let Some(b) = &self.bind {
            cfg.status_bind = Some(b.clone());
        } else if self.serve_ui && cfg.status_bind.is_none() {
            cfg.status_bind = Some("127.0.0.1:8080".into());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ionbridge_monitor=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load_or_default(cli.config.as_deref())?;
    cli.apply(&mut cfg);

    info!(
        default_address = %cfg.default_address,
        feed = %format!(":{}{}", cfg.feed_port, cfg.feed_path),
        interval_ms = cfg.poll_interval_ms,
        workers = cfg.scan_workers,
        cache = %cfg
            .cache_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string()),
        "ionbridge-monitor v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cache: Arc<dyn AddressCache> = match &cfg.cache_path {
        Some(p) => Arc::new(FileAddressCache::new(p)),
        None => Arc::new(MemoryAddressCache::new()),
    };
    let scanner = Arc::new(Scanner::new(
        Arc::new(HttpProber::new(cfg.probe_settings())),
        cache,
        cfg.scan_settings(),
    ));
    let network: Arc<dyn LocalNetwork> = Arc::new(InterfaceNetwork);

    if cli.scan_only {
        return scan_once(&scanner, network.as_ref(), cli.output.as_deref()).await;
    }

    let poller = TelemetryPoller::new(
        cfg.poller_config(),
        scanner,
        Box::new(HttpFeedClient::new(cfg.fetch_timeout())),
        network,
    );
    let shutdown = CancellationToken::new();

    if let Some(bind) = cfg.status_bind.clone() {
        let state = AppState::new(poller.subscribe(), poller.subscribe_status());
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state, token).await {
                warn!("status API error: {e:#}");
            }
        });
    }

    let mut discovery = poller.subscribe_discovery();
    tokio::spawn(async move {
        while let Ok(outcome) = discovery.recv().await {
            if outcome.matched {
                info!(address = %outcome.address, "discovery match");
            }
        }
    });

    if cli.print {
        let mut updates = poller.subscribe();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let model = updates.borrow_and_update().clone();
                print_power_table(&model);
            }
        });
    }

    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        token.cancel();
    });

    poller.run(shutdown).await;
    Ok(())
}

async fn scan_once(
    scanner: &Scanner,
    network: &dyn LocalNetwork,
    output: Option<&std::path::Path>,
) -> Result<()> {
    if let Some(ip) = network.local_ipv4() {
        println!("Scanning {}1-254 ...", netdetect::subnet_prefix(ip));
    }
    let report = scanner
        .scan_local(network, |_| {})
        .await
        .context("discovery scan failed")?;

    println!(
        "\nProbed: {}  matches: {}",
        report.probed,
        report.matches.len()
    );
    for m in &report.matches {
        let marker = if report.persisted.as_deref() == Some(m.as_str()) {
            " (saved)"
        } else {
            ""
        };
        println!("  {m}{marker}");
    }
    if let Some(path) = output {
        if let Err(e) = write_report_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON report to {}", path.display());
        }
    }
    Ok(())
}

fn print_power_table(model: &PowerModel) {
    let name_w = 4usize;
    let num_w = 8usize;
    println!(
        "\nTotal: {:.2} W ({}%)  {}",
        model.total_watts,
        model.total_load_percent(),
        if model.data_valid { "ok" } else { "STALE" }
    );
    println!(
        "{:<name_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>5}  {:>5}",
        "port",
        "mA",
        "mV",
        "W",
        "state",
        "proto",
        name_w = name_w,
        num_w = num_w
    );
    for p in &model.ports {
        println!(
            "{:<name_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$.2}  {:>5}  {:>5}",
            p.name,
            p.current_milliamps,
            p.voltage_millivolts,
            p.power_watts,
            p.state,
            p.protocol,
            name_w = name_w,
            num_w = num_w
        );
    }
}

fn write_report_json(path: &std::path::Path, report: &ScanReport) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
