//! RangeGuard Core - shared types, errors and configuration
//!
//! Base vocabulary for the sandbox mediation layer: identifiers, the
//! command request type, the error taxonomy and the workspace-wide
//! configuration tree.

pub mod config;
pub mod error;
pub mod types;

pub use config::*;
pub use error::*;
pub use types::*;
