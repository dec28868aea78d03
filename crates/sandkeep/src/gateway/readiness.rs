//! Readiness waiter.
//!
//! Polls the gateway's control endpoint until it answers or a deadline
//! passes. Sleeps between polls and never reports a timeout before the
//! deadline.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ReadinessConfig;

/// How the control endpoint is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Complete a WebSocket handshake.
    #[default]
    Websocket,
    /// Open a TCP connection.
    Tcp,
}

/// Where the gateway's control endpoint lives.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl std::fmt::Debug for GatewayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GatewayEndpoint {
    pub fn local(port: u16, token: Option<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            token,
        }
    }

    /// WebSocket URL without credentials.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// A single liveness check against the control endpoint.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, endpoint: &GatewayEndpoint) -> bool;
}

/// Ready once the port accepts a TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self, endpoint: &GatewayEndpoint) -> bool {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
    }
}

/// Ready once a WebSocket handshake with the gateway completes.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketProbe {
    timeout: Duration,
}

impl WebSocketProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReadinessProbe for WebSocketProbe {
    async fn probe(&self, endpoint: &GatewayEndpoint) -> bool {
        let url = match &endpoint.token {
            Some(token) => format!("{}/?token={}", endpoint.ws_url(), urlencoding::encode(token)),
            None => endpoint.ws_url(),
        };

        match tokio::time::timeout(self.timeout, connect_async(url.as_str())).await {
            Ok(Ok((mut socket, _))) => {
                let _ = socket.close(None).await;
                true
            }
            Ok(Err(e)) => {
                debug!("WebSocket probe on port {} failed: {}", endpoint.port, e);
                false
            }
            Err(_) => {
                debug!("WebSocket probe on port {} timed out", endpoint.port);
                false
            }
        }
    }
}

/// Build the probe selected in configuration.
pub fn probe_for(config: &ReadinessConfig) -> std::sync::Arc<dyn ReadinessProbe> {
    let timeout = Duration::from_millis(config.probe_timeout_ms);
    match config.mode {
        ProbeMode::Websocket => std::sync::Arc::new(WebSocketProbe::new(timeout)),
        ProbeMode::Tcp => std::sync::Arc::new(TcpProbe::new(timeout)),
    }
}

/// Bounds for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Options for one-shot waits (CLI invocations, status checks).
    pub fn from_config(config: &ReadinessConfig) -> Self {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            Duration::from_millis(config.interval_ms.max(1)),
        )
    }

    /// Options for the wait after starting the gateway.
    pub fn startup(config: &ReadinessConfig) -> Self {
        Self::new(
            Duration::from_secs(config.startup_timeout_secs),
            Duration::from_millis(config.interval_ms.max(1)),
        )
    }
}

/// Result of [`wait_until_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
    /// The caller's cancellation fired first.
    Cancelled { attempts: u32, elapsed: Duration },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

/// Poll `probe` until it succeeds, `opts.timeout` elapses, or `cancel` fires.
///
/// A probe still in flight at the deadline is abandoned.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    endpoint: &GatewayEndpoint,
    opts: WaitOptions,
    cancel: &CancellationToken,
) -> Readiness {
    let start = Instant::now();
    let deadline = start + opts.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Readiness::Cancelled { attempts, elapsed: start.elapsed() };
            }
            r = tokio::time::timeout_at(deadline, probe.probe(endpoint)) => r.unwrap_or(false),
        };

        if ready {
            let elapsed = start.elapsed();
            debug!(
                "Port {} ready after {} attempt(s) in {:?}",
                endpoint.port, attempts, elapsed
            );
            return Readiness::Ready { attempts, elapsed };
        }

        let now = Instant::now();
        if now >= deadline {
            return Readiness::TimedOut {
                attempts,
                elapsed: start.elapsed(),
            };
        }

        let pause = opts.interval.min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Readiness::Cancelled { attempts, elapsed: start.elapsed() };
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
