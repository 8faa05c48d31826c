//! RangeGuard Security - command mediation layer
//!
//! Whitelist/pattern validation, container-escape detection, per-user
//! sliding-window rate limiting and the append-only audit log.

pub mod alert;
pub mod audit;
pub mod breakout;
pub mod rate_limit;
pub mod types;
pub mod validator;

pub use alert::*;
pub use audit::*;
pub use breakout::*;
pub use rate_limit::*;
pub use types::*;
pub use validator::*;
