//! Container runtime capability interface
//!
//! The core never talks to a concrete runtime API directly; everything
//! goes through [`ContainerRuntime`], which lets tests substitute the
//! in-memory fake and keeps the lifecycle manager runtime-agnostic.

use async_trait::async_trait;
use thiserror::Error;

use rangeguard_core::ResourceCeiling;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container creation failed: {0}")]
    CreateFailed(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),

    #[error("internal runtime error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Request to allocate one sandbox environment.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Runtime-visible container name
    pub name: String,
    /// Image the toolset ships in; overridden by `seed_image` on restore
    pub image: String,
    pub ceiling: ResourceCeiling,
    /// Runtime network the container attaches to
    pub network: String,
    /// Snapshot image to boot from instead of the base image
    pub seed_image: Option<String>,
}

/// Captured output of one command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Driver primitives the lifecycle manager consumes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Allocate and start a container; returns the runtime handle.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Destroy the container and free its resources.
    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Run one command inside the container and capture its output.
    /// Cancellation on timeout is the caller's concern; `interrupt`
    /// reclaims the resources afterwards.
    async fn exec(&self, handle: &str, command: &str) -> Result<ExecOutput, RuntimeError>;

    /// Kill any in-flight processes without destroying the container.
    async fn interrupt(&self, handle: &str) -> Result<(), RuntimeError>;

    /// Capture the container filesystem as a reusable image reference.
    async fn snapshot(&self, handle: &str, tag: &str) -> Result<String, RuntimeError>;

    /// Liveness probe of the underlying runtime.
    async fn ping(&self) -> Result<(), RuntimeError>;
}
