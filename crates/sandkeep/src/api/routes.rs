//! Control surface routes.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use crate::supervisor::Supervisor;

/// Create the control router.
pub fn create_router(supervisor: Arc<Supervisor>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/sync", post(handlers::trigger_sync))
        .route("/gateway/ensure", post(handlers::ensure_gateway))
        .fallback(handlers::not_found)
        .with_state(supervisor)
        .layer(trace_layer)
}
