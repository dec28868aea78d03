//! Gateway process lifecycle.
//!
//! - `registry`: container process API (list, start, stop, output)
//! - `launch`: environment and argument construction
//! - `readiness`: bounded polling of the control endpoint
//! - `lifecycle`: at-most-one gateway, ready before it is handed out
//! - `cli`: one-shot CLI invocations against the running gateway

mod cli;
mod error;
mod launch;
mod lifecycle;
mod readiness;
mod registry;

pub use cli::{CliOutput, GatewayCli};
pub use error::{GatewayError, GatewayResult, ProcessStartFailure};
pub use launch::{EnvMapping, GatewayLaunch, HalfStartedPolicy, build_env};
pub use lifecycle::{GatewayManager, GatewayProcess, GatewaySnapshot, GatewayState};
pub use readiness::{
    GatewayEndpoint, ProbeMode, Readiness, ReadinessProbe, TcpProbe, WaitOptions, WebSocketProbe,
    probe_for, wait_until_ready,
};
pub use registry::{
    CommandSignature, LaunchSpec, OsProcessRegistry, OutputBuffer, ProcessInfo, ProcessRegistry,
    ProcessStatus, format_exit_status, redact_args,
};
