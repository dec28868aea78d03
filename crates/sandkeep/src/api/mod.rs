//! Localhost control surface.
//!
//! Thin HTTP layer over the supervisor's outward interfaces: health, status,
//! manual sync and "make sure the gateway is up".

mod error;
mod handlers;
mod routes;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
