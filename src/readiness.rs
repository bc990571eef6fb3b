use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_millis(800);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// How the supervisor decides the backend is accepting connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessDetector {
    /// Substring containment on each decoded stdout chunk; first match wins.
    StdoutPattern(String),
    /// Any HTTP response from `url` counts as up.
    HttpPoll { url: String, interval: Duration },
    /// A TCP connect to `addr` succeeds.
    PortOpen { addr: SocketAddr, interval: Duration },
    /// Ready once the delay has passed.
    FixedDelay(Duration),
}

/// What established readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadySignal {
    Pattern,
    Probe,
    Delay,
    TimeoutFallback,
}

impl ReadinessDetector {
    pub fn stdout_pattern(&self) -> Option<&str> {
        match self {
            Self::StdoutPattern(pattern) => Some(pattern.as_str()),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::StdoutPattern(pattern) => format!("stdout pattern {pattern:?}"),
            Self::HttpPoll { url, .. } => format!("http poll {url}"),
            Self::PortOpen { addr, .. } => format!("port probe {addr}"),
            Self::FixedDelay(delay) => format!("fixed delay {}ms", delay.as_millis()),
        }
    }

    /// Resolves once the detector fires. For `StdoutPattern` the output
    /// reader owns the match and reports it through `pattern_rx`; if the
    /// reader goes away without a match this never resolves.
    pub(crate) async fn wait(self, pattern_rx: oneshot::Receiver<()>) -> ReadySignal {
        match self {
            Self::StdoutPattern(_) => {
                if pattern_rx.await.is_ok() {
                    return ReadySignal::Pattern;
                }
                std::future::pending::<ReadySignal>().await
            }
            Self::HttpPoll { url, interval } => {
                poll_http(&url, interval).await;
                ReadySignal::Probe
            }
            Self::PortOpen { addr, interval } => {
                poll_port(addr, interval).await;
                ReadySignal::Probe
            }
            Self::FixedDelay(delay) => {
                tokio::time::sleep(delay).await;
                ReadySignal::Delay
            }
        }
    }
}

/// Case-sensitive containment, the same test the backend banner is held to.
pub fn chunk_matches(chunk: &str, pattern: &str) -> bool {
    !pattern.is_empty() && chunk.contains(pattern)
}

async fn poll_http(url: &str, interval: Duration) {
    let client = match reqwest::Client::builder()
        .timeout(PROBE_REQUEST_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            log::warn!("http readiness probe unavailable ({err}), waiting for timeout");
            return std::future::pending::<()>().await;
        }
    };
    loop {
        match client.get(url).send().await {
            Ok(response) => {
                log::debug!("readiness probe {url} answered {}", response.status());
                return;
            }
            Err(err) => log::debug!("readiness probe {url} not up yet: {err}"),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn poll_port(addr: SocketAddr, interval: Duration) {
    loop {
        if let Ok(Ok(_)) = tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}
