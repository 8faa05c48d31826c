//! Unified error taxonomy

use thiserror::Error;

/// Terminal failure classes surfaced to the calling orchestrator.
///
/// Denials (`ValidationDenied`, `RateLimitExceeded`, `BreakoutDetected`,
/// `ContainerQuarantined`) are final and never retried by the core.
/// Runtime-level failures are reported as-is; retry policy belongs to
/// the caller.
#[derive(Error, Debug)]
pub enum RangeGuardError {
    #[error("validation denied: {0}")]
    ValidationDenied(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("breakout attempt detected: {0}")]
    BreakoutDetected(String),

    #[error("container quarantined: {0}")]
    ContainerQuarantined(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("execution timed out after {0}s")]
    ExecutionTimeout(u64),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container busy: {0}")]
    ContainerBusy(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("audit log unavailable: {0}")]
    AuditUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RangeGuardError {
    /// Stable machine-readable reason code, used in API responses and
    /// audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationDenied(_) => "VALIDATION_DENIED",
            Self::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            Self::BreakoutDetected(_) => "BREAKOUT_DETECTED",
            Self::ContainerQuarantined(_) => "CONTAINER_QUARANTINED",
            Self::Provision(_) => "PROVISION_ERROR",
            Self::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            Self::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            Self::ContainerBusy(_) => "CONTAINER_BUSY",
            Self::ContainerNotFound(_) => "CONTAINER_NOT_FOUND",
            Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::AuditUnavailable(_) => "AUDIT_UNAVAILABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RangeGuardError>;
