//! RangeGuard Sandbox - container lifecycle and execution pipeline
//!
//! Owns the sandbox container state machine (provision, quarantine,
//! snapshot, terminate), abstracts the container runtime behind a
//! capability trait, and hosts the execution pipeline that mediates
//! every command through the security layers before dispatch.

pub mod docker;
pub mod fake;
pub mod lifecycle;
pub mod pipeline;
pub mod runtime;

pub use docker::*;
pub use fake::*;
pub use lifecycle::*;
pub use pipeline::*;
pub use runtime::*;
