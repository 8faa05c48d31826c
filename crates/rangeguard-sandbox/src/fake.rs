//! In-memory runtime driver
//!
//! Deterministic stand-in for Docker: used by the test suites and by the
//! server when no runtime socket is available. Commands return scripted
//! outputs, or an echo of the command when unscripted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeError};

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    alive: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: RwLock<HashMap<String, FakeContainer>>,
    scripted: RwLock<HashMap<String, ExecOutput>>,
    exec_delay: RwLock<Option<Duration>>,
    exec_count: RwLock<u64>,
    interrupt_count: RwLock<u64>,
    fail_create: RwLock<bool>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fix the output returned for one exact command string.
    pub async fn script(&self, command: &str, exit_code: i64, stdout: &str, stderr: &str) {
        self.scripted.write().await.insert(
            command.to_string(),
            ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    /// Delay every exec; used to exercise the pipeline timeout path.
    pub async fn set_exec_delay(&self, delay: Option<Duration>) {
        *self.exec_delay.write().await = delay;
    }

    /// Make the next `create` calls fail, simulating resource exhaustion.
    pub async fn set_fail_create(&self, fail: bool) {
        *self.fail_create.write().await = fail;
    }

    /// Number of commands that reached the runtime.
    pub async fn exec_count(&self) -> u64 {
        *self.exec_count.read().await
    }

    pub async fn interrupt_count(&self) -> u64 {
        *self.interrupt_count.read().await
    }

    pub async fn is_alive(&self, handle: &str) -> bool {
        self.containers
            .read()
            .await
            .get(handle)
            .map(|c| c.alive)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if *self.fail_create.read().await {
            return Err(RuntimeError::CreateFailed(
                "fake runtime: resources exhausted".to_string(),
            ));
        }
        let handle = format!("fake-{}", Uuid::new_v4());
        self.containers.write().await.insert(
            handle.clone(),
            FakeContainer {
                spec: spec.clone(),
                alive: true,
            },
        );
        Ok(handle)
    }

    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.write().await;
        match containers.get_mut(handle) {
            Some(container) => {
                container.alive = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(handle.to_string())),
        }
    }

    async fn exec(&self, handle: &str, command: &str) -> Result<ExecOutput, RuntimeError> {
        if !self.is_alive(handle).await {
            return Err(RuntimeError::NotFound(handle.to_string()));
        }
        if let Some(delay) = *self.exec_delay.read().await {
            tokio::time::sleep(delay).await;
        }
        *self.exec_count.write().await += 1;

        if let Some(output) = self.scripted.read().await.get(command) {
            return Ok(output.clone());
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("[fake] {}", command),
            stderr: String::new(),
        })
    }

    async fn interrupt(&self, handle: &str) -> Result<(), RuntimeError> {
        if !self.is_alive(handle).await {
            return Err(RuntimeError::NotFound(handle.to_string()));
        }
        *self.interrupt_count.write().await += 1;
        Ok(())
    }

    async fn snapshot(&self, handle: &str, tag: &str) -> Result<String, RuntimeError> {
        if !self.is_alive(handle).await {
            return Err(RuntimeError::NotFound(handle.to_string()));
        }
        Ok(format!("fake-snap:{}", tag))
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangeguard_core::ResourceCeiling;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "t".to_string(),
            image: "img".to_string(),
            ceiling: ResourceCeiling::default(),
            network: "range-isolated".to_string(),
            seed_image: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_and_default_output() {
        let runtime = FakeRuntime::new();
        let handle = runtime.create(&spec()).await.unwrap();

        runtime.script("id", 0, "uid=0(root)", "").await;
        let out = runtime.exec(&handle, "id").await.unwrap();
        assert_eq!(out.stdout, "uid=0(root)");

        let out = runtime.exec(&handle, "whoami").await.unwrap();
        assert_eq!(out.stdout, "[fake] whoami");
        assert_eq!(runtime.exec_count().await, 2);
    }

    #[tokio::test]
    async fn test_destroyed_container_rejects_exec() {
        let runtime = FakeRuntime::new();
        let handle = runtime.create(&spec()).await.unwrap();
        runtime.destroy(&handle).await.unwrap();
        assert!(runtime.exec(&handle, "id").await.is_err());
    }

    #[tokio::test]
    async fn test_fail_create() {
        let runtime = FakeRuntime::new();
        runtime.set_fail_create(true).await;
        assert!(runtime.create(&spec()).await.is_err());
    }
}
