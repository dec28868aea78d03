//! Sandkeep: gateway lifecycle and durable state for sandboxed assistant
//! containers.
//!
//! The remote bucket is mounted once, restored from once at startup, and
//! pushed to periodically afterwards. The gateway process is started at most
//! once per container and only handed out when its control endpoint answers.

pub mod api;
pub mod config;
pub mod failure;
pub mod gateway;
pub mod persist;
pub mod secrets;
pub mod storage;
pub mod supervisor;
