//! Gateway lifecycle errors.

use std::time::Duration;

use thiserror::Error;

use crate::failure::{Classified, FailureCategory};

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Why the gateway process did not start.
#[derive(Debug, Error)]
pub enum ProcessStartFailure {
    #[error("gateway binary not found: {0}")]
    BinaryMissing(String),

    #[error("port {port} already bound by {}", .holder.as_deref().unwrap_or("an unknown process"))]
    PortInUse { port: u16, holder: Option<String> },

    #[error("spawning gateway failed: {0}")]
    Spawn(String),

    #[error("gateway {status}; last output:\n{}", .output.join("\n"))]
    ExitedEarly { status: String, output: Vec<String> },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    ProcessStart(#[from] ProcessStartFailure),

    #[error("gateway{} not ready after {timeout:?}", .pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    ReadinessTimeout { pid: Option<u32>, timeout: Duration },

    #[error("reading process table failed: {0}")]
    Registry(#[source] std::io::Error),

    #[error("gateway cli failed to run: {0}")]
    CliSpawn(#[source] std::io::Error),

    #[error("gateway cli timed out after {0:?}")]
    CliTimedOut(Duration),
}

impl GatewayError {
    /// Stable error code for the control surface.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ReadinessTimeout { .. } => "readiness_timeout",
            GatewayError::ProcessStart(_) | GatewayError::Registry(_) => "process_start_failed",
            GatewayError::CliSpawn(_) | GatewayError::CliTimedOut(_) => "gateway_cli_failed",
        }
    }
}

impl Classified for GatewayError {
    fn category(&self) -> FailureCategory {
        match self {
            GatewayError::ReadinessTimeout { .. } => FailureCategory::Readiness,
            _ => FailureCategory::ProcessStart,
        }
    }

    fn summary(&self) -> String {
        match self {
            GatewayError::ProcessStart(failure) => match failure {
                ProcessStartFailure::BinaryMissing(bin) => format!("gateway binary missing ({bin})"),
                ProcessStartFailure::PortInUse { port, holder } => match holder {
                    Some(holder) => format!("port {port} in use by {holder}"),
                    None => format!("port {port} in use"),
                },
                ProcessStartFailure::Spawn(_) => "gateway could not be spawned".to_string(),
                ProcessStartFailure::ExitedEarly { status, .. } => {
                    format!("gateway {status} during startup")
                }
            },
            GatewayError::ReadinessTimeout { timeout, .. } => {
                format!("gateway not ready after {}s", timeout.as_secs())
            }
            GatewayError::Registry(e) => format!("process table unavailable ({:?})", e.kind()),
            GatewayError::CliSpawn(e) => format!("gateway cli failed to run ({:?})", e.kind()),
            GatewayError::CliTimedOut(d) => format!("gateway cli timed out after {}s", d.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_exit_summary_hides_output() {
        let err = GatewayError::from(ProcessStartFailure::ExitedEarly {
            status: "exited with code 1".to_string(),
            output: vec!["Error: invalid token sk-ant-xyz".to_string()],
        });
        assert_eq!(err.summary(), "gateway exited with code 1 during startup");
        assert!(err.to_string().contains("invalid token"));
        assert_eq!(err.category(), FailureCategory::ProcessStart);
        assert_eq!(err.code(), "process_start_failed");
    }

    #[test]
    fn test_readiness_timeout_is_distinct() {
        let err = GatewayError::ReadinessTimeout {
            pid: Some(42),
            timeout: Duration::from_secs(15),
        };
        assert_eq!(err.category(), FailureCategory::Readiness);
        assert_eq!(err.code(), "readiness_timeout");
        assert_eq!(err.to_string(), "gateway (pid 42) not ready after 15s");
    }

    #[test]
    fn test_port_in_use_names_holder() {
        let err = GatewayError::from(ProcessStartFailure::PortInUse {
            port: 18789,
            holder: Some("python3 (pid 7)".to_string()),
        });
        assert_eq!(err.summary(), "port 18789 in use by python3 (pid 7)");
    }
}
