//! Control surface errors with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::supervisor::SupervisorError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Supervisor {
        status: StatusCode,
        code: &'static str,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Supervisor { status, .. } => *status,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Supervisor { code, .. } => *code,
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Only the classified summary crosses this boundary.
impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let code = err.code();
        let status = match code {
            "readiness_timeout" => StatusCode::GATEWAY_TIMEOUT,
            "storage_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        ApiError::Supervisor {
            status,
            code,
            message: err.summary(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let error = self.to_string();

        if status.is_server_error() {
            warn!(error_code, message = %error, "Control request failed");
        } else {
            debug!(error_code, message = %error, "Client error");
        }

        (status, Json(ErrorResponse { error, error_code })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
