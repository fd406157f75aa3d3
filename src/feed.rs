use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("ionbridge-monitor/", env!("CARGO_PKG_VERSION"));

/// Which part of a request failed; drives the client-reset policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    /// TCP connect did not complete.
    Connection,
    /// Connected, but the exchange broke or timed out.
    Protocol,
    /// A full response arrived but was not usable.
    Response,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transfer failed: {0}")]
    Protocol(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("payload contained no port readings")]
    EmptyPayload,
}

impl FetchError {
    pub fn phase(&self) -> FailurePhase {
        match self {
            FetchError::Connect(_) => FailurePhase::Connection,
            FetchError::Timeout | FetchError::Protocol(_) => FailurePhase::Protocol,
            FetchError::Status(_) | FetchError::EmptyPayload => FailurePhase::Response,
        }
    }
}

/// Source of raw feed payloads.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// GET `url` and return the body of a 200 response.
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError>;

    /// Drop any pooled connection state; the next fetch starts fresh.
    fn reset(&mut self);
}

/// Feed client over a single long-lived `reqwest::Client`, created lazily.
pub struct HttpFeedClient {
    timeout: Duration,
    client: Option<reqwest::Client>,
}

impl HttpFeedClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&reqwest::Client, FetchError> {
        if self.client.is_none() {
            let client = reqwest::Client::builder()
                .timeout(self.timeout)
                .connect_timeout(self.timeout)
                .redirect(reqwest::redirect::Policy::none())
                .pool_max_idle_per_host(1)
                .user_agent(USER_AGENT)
                .build()
                .map_err(|e| FetchError::Protocol(e.to_string()))?;
            debug!(timeout_ms = self.timeout.as_millis() as u64, "created feed client");
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| FetchError::Protocol("feed client unavailable".into()))
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch(&mut self, url: &str) -> Result<String, FetchError> {
        let client = self.client()?;
        let resp = client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/plain")
            .send()
            .await
            .map_err(classify)?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }
        resp.text().await.map_err(classify)
    }

    fn reset(&mut self) {
        if self.client.take().is_some() {
            debug!("dropped feed client");
        }
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_connect() {
        FetchError::Connect(e.to_string())
    } else {
        FetchError::Protocol(e.to_string())
    }
}

/// `http://<address>[:port]<path>`; port 80 is left implicit.
pub fn feed_url(address: &str, port: u16, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if port == 80 {
        format!("http://{address}{path}")
    } else {
        format!("http://{address}:{port}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut req = [0u8; 2048];
                let _ = sock.read(&mut req).await;
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        port
    }

    #[test]
    fn url_formatting() {
        assert_eq!(feed_url("10.0.0.5", 80, "/metrics"), "http://10.0.0.5/metrics");
        assert_eq!(feed_url("10.0.0.5", 8080, "metrics"), "http://10.0.0.5:8080/metrics");
    }

    #[test]
    fn phases() {
        assert_eq!(FetchError::Connect("x".into()).phase(), FailurePhase::Connection);
        assert_eq!(FetchError::Timeout.phase(), FailurePhase::Protocol);
        assert_eq!(FetchError::Status(503).phase(), FailurePhase::Response);
    }

    #[tokio::test]
    async fn fetches_ok_body() {
        let port = serve(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 34\r\nConnection: close\r\n\r\nionbridge_port_current{id=\"0\"} 150",
        )
        .await;
        let mut client = HttpFeedClient::new(Duration::from_secs(2));
        let body = client
            .fetch(&feed_url("127.0.0.1", port, "/metrics"))
            .await
            .unwrap();
        assert_eq!(body, "ionbridge_port_current{id=\"0\"} 150");
    }

    #[tokio::test]
    async fn non_200_is_status_error() {
        let port = serve("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let mut client = HttpFeedClient::new(Duration::from_secs(2));
        let err = client
            .fetch(&feed_url("127.0.0.1", port, "/metrics"))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Status(404));
    }

    #[tokio::test]
    async fn refused_connection_is_not_a_status_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut client = HttpFeedClient::new(Duration::from_millis(500));
        let err = client
            .fetch(&feed_url("127.0.0.1", port, "/metrics"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Connect(_) | FetchError::Protocol(_)));
        client.reset();
        assert!(client.client.is_none());
    }
}
