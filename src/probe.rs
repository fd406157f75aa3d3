use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, trace};

/// Substring that only the hub's metrics feed emits.
pub const DEFAULT_SIGNATURE: &str = "ionbridge_port_current";

/// Pause between retries of the same address.
const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Reachability and identity check for one candidate address.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns `true` when `address` serves the hub's feed. Misses are not errors.
    async fn probe(&self, address: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub port: u16,
    pub path: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Response bytes kept; anything beyond is dropped, not rejected.
    pub max_response_bytes: usize,
    pub attempts: u32,
    pub signature: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            port: 80,
            path: "/metrics".into(),
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(1000),
            max_response_bytes: 2048,
            attempts: 1,
            signature: DEFAULT_SIGNATURE.into(),
        }
    }
}

/// Why a single probe attempt did not match. Only ever logged.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("read timed out")]
    ReadTimeout,
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("response did not contain the feed signature ({0} bytes)")]
    Malformed(usize),
}

/// Probes with a raw TCP connect followed by a one-shot `GET` of the feed path.
#[derive(Debug, Clone, Default)]
pub struct HttpProber {
    settings: ProbeSettings,
}

impl HttpProber {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    async fn attempt(&self, address: &str) -> Result<(), ProbeError> {
        let s = &self.settings;
        let mut stream = match time::timeout(
            s.connect_timeout,
            TcpStream::connect((address, s.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProbeError::Connect(e)),
            Err(_) => return Err(ProbeError::ConnectTimeout),
        };
        trace!(address, port = s.port, "port open, requesting feed");

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            s.path, address
        );
        time::timeout(s.read_timeout, stream.write_all(request.as_bytes()))
            .await
            .map_err(|_| ProbeError::ReadTimeout)??;

        let response = read_capped(&mut stream, s.max_response_bytes, s.read_timeout).await?;
        // Headers and body are searched together; some firmware skips the blank line.
        if contains(&response, s.signature.as_bytes()) {
            Ok(())
        } else {
            Err(ProbeError::Malformed(response.len()))
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, address: &str) -> bool {
        let attempts = self.settings.attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                time::sleep(RETRY_PAUSE).await;
            }
            match self.attempt(address).await {
                Ok(()) => {
                    debug!(address, "feed signature found");
                    return true;
                }
                Err(e) => trace!(address, attempt, "probe miss: {e}"),
            }
        }
        false
    }
}

/// Read until EOF or `cap` bytes. The read timeout applies to each read call.
/// A timeout after some bytes arrived ends the read with what was collected.
async fn read_capped(
    stream: &mut TcpStream,
    cap: usize,
    read_timeout: Duration,
) -> Result<Vec<u8>, ProbeError> {
    let mut out = Vec::with_capacity(cap.min(8192));
    let mut buf = [0u8; 512];
    while out.len() < cap {
        match time::timeout(read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let take = n.min(cap - out.len());
                out.extend_from_slice(&buf[..take]);
            }
            Ok(Err(e)) if out.is_empty() => return Err(ProbeError::Io(e)),
            Ok(Err(_)) => break,
            Err(_) if out.is_empty() => return Err(ProbeError::ReadTimeout),
            Err(_) => break,
        }
    }
    Ok(out)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
