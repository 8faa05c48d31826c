//! RangeGuard Server - HTTP control plane
//!
//! Exposes the execution pipeline and lifecycle manager over an axum
//! router: command execution, session provisioning, snapshot/restore
//! and the security reporting endpoints.

pub mod api;
pub mod gateway;

pub use api::*;
pub use gateway::*;
