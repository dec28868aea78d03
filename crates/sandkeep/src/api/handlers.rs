//! Control surface handlers.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{StatusCode, Uri},
};
use serde::Serialize;

use super::error::{ApiError, ApiResult};
use crate::gateway::GatewayProcess;
use crate::persist::SyncRun;
use crate::supervisor::{StatusReport, Supervisor};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Mount state, restore decision, sync counters, gateway readiness and the
/// latest failure per category.
pub async fn status(State(supervisor): State<Arc<Supervisor>>) -> Json<StatusReport> {
    Json(supervisor.status().await)
}

/// Run a manual sync. Skips and failures are reported in the body.
pub async fn trigger_sync(
    State(supervisor): State<Arc<Supervisor>>,
) -> (StatusCode, Json<SyncRun>) {
    let run = supervisor.trigger_manual_sync().await;
    let status = if run.skip_reason().is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(run))
}

pub async fn ensure_gateway(
    State(supervisor): State<Arc<Supervisor>>,
) -> ApiResult<Json<GatewayProcess>> {
    let process = supervisor.ensure_gateway_running().await?;
    Ok(Json(process))
}

pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
