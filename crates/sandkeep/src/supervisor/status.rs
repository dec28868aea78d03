use serde::{Deserialize, Serialize};

use crate::failure::FailureRecord;
use crate::gateway::{GatewaySnapshot, GatewayState};
use crate::persist::{RestoreDecision, SyncSnapshot};
use crate::storage::{MountSnapshot, MountStatus};

/// Everything the health/debug surface shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub mount: MountSnapshot,
    /// `None` until the startup restore decision has been made.
    pub restore: Option<RestoreDecision>,
    pub sync: SyncSnapshot,
    pub gateway: GatewaySnapshot,
    /// Most recent failure per category.
    pub failures: Vec<FailureRecord>,
}

impl StatusReport {
    /// Healthy when the gateway is ready and state is durable.
    pub fn healthy(&self) -> bool {
        self.gateway.state == GatewayState::Ready && self.mount.status == MountStatus::Mounted
    }
}

/// Outcome of the boot sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootReport {
    pub mounted: bool,
    pub restore: RestoreDecision,
    pub gateway_ready: bool,
}
