//! Shared identifier and request types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// User ID
pub type UserId = String;

/// Session ID
pub type SessionId = String;

/// Container ID
pub type ContainerId = String;

/// Snapshot ID
pub type SnapshotId = String;

/// Default command execution timeout (seconds).
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;

/// Resource ceiling for one sandbox container.
///
/// Immutable after provisioning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceCeiling {
    /// CPU limit in cores
    pub cpu_cores: f64,
    /// Memory limit in bytes
    pub memory_bytes: u64,
}

impl Default for ResourceCeiling {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Which of the two pre-existing range segments a container is attached to.
///
/// Immutable after provisioning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSegment {
    /// Shared training segment with the target hosts
    Training,
    /// Fully isolated segment, no lateral reachability
    Isolated,
}

impl std::fmt::Display for NetworkSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkSegment::Training => write!(f, "training"),
            NetworkSegment::Isolated => write!(f, "isolated"),
        }
    }
}

/// One proposed command invocation. Immutable once created, consumed
/// exactly once by the execution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub user_id: UserId,
    pub container_id: ContainerId,
    pub command: String,
    pub submitted_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

impl CommandRequest {
    pub fn new(user_id: &str, container_id: &str, command: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            container_id: container_id.to_string(),
            command: command.to_string(),
            submitted_at: Utc::now(),
            timeout_secs: DEFAULT_EXEC_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
