//! One-shot gateway CLI invocations (`clawdbot devices list --json`, ...).
//!
//! These connect to the running gateway themselves, so they are only run
//! once the control endpoint answers.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{GatewayError, GatewayResult, ProcessStartFailure};
use super::readiness::{GatewayEndpoint, ReadinessProbe, WaitOptions, wait_until_ready};
use super::registry::redact_args;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub struct GatewayCli {
    binary: String,
    endpoint: GatewayEndpoint,
    probe: Arc<dyn ReadinessProbe>,
    wait: WaitOptions,
    timeout: Duration,
}

impl GatewayCli {
    pub fn new(
        binary: impl Into<String>,
        endpoint: GatewayEndpoint,
        probe: Arc<dyn ReadinessProbe>,
        wait: WaitOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            endpoint,
            probe,
            wait,
            timeout,
        }
    }

    /// Full argument list for an invocation.
    pub fn build_args(&self, args: &[String]) -> Vec<String> {
        let mut full = args.to_vec();
        full.push("--url".to_string());
        full.push(self.endpoint.ws_url());
        if let Some(ref token) = self.endpoint.token {
            full.push("--token".to_string());
            full.push(token.clone());
        }
        full
    }

    /// Wait for the gateway, then run `<binary> <args> --url ... [--token ...]`.
    pub async fn run(&self, args: &[String], cancel: &CancellationToken) -> GatewayResult<CliOutput> {
        let readiness = wait_until_ready(self.probe.as_ref(), &self.endpoint, self.wait, cancel).await;
        if !readiness.is_ready() {
            return Err(GatewayError::ReadinessTimeout {
                pid: None,
                timeout: self.wait.timeout,
            });
        }

        let full = self.build_args(args);
        info!("Running {} {:?}", self.binary, redact_args(&full));

        let child = Command::new(&self.binary)
            .args(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    GatewayError::from(ProcessStartFailure::BinaryMissing(self.binary.clone()))
                }
                _ => GatewayError::CliSpawn(e),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GatewayError::CliTimedOut(self.timeout))?
            .map_err(GatewayError::CliSpawn)?;

        let result = CliOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with {:?}", self.binary, result.code);
        Ok(result)
    }
}
