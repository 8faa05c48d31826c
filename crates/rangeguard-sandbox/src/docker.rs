//! Docker-backed container runtime driver

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeError};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub async fn new() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub async fn connect(uri: &str) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_socket(uri, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        debug!(image, "pulling image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                warn!(image, error = %e, "image pull warning");
            }
        }
        Ok(())
    }

    fn build_config(&self, spec: &ContainerSpec, image: &str) -> Config<String> {
        let host_config = bollard::models::HostConfig {
            memory: Some(spec.ceiling.memory_bytes as i64),
            cpu_period: Some(100_000),
            cpu_quota: Some((spec.ceiling.cpu_cores * 100_000.0) as i64),
            pids_limit: Some(256),
            network_mode: Some(spec.network.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            // raw sockets for the scanning toolset, nothing else
            cap_add: Some(vec!["NET_RAW".to_string(), "NET_ADMIN".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let image = spec.seed_image.as_deref().unwrap_or(&spec.image);

        // snapshot images are local; only pull base images
        if spec.seed_image.is_none() {
            self.pull_image(image).await?;
        }

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: &spec.name,
                    platform: None,
                }),
                self.build_config(spec, image),
            )
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        info!(name = %spec.name, handle = %container.id, network = %spec.network, "container started");
        Ok(container.id)
    }

    async fn destroy(&self, handle: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RuntimeError::NotFound(e.to_string()))?;
        info!(handle, "container destroyed");
        Ok(())
    }

    async fn exec(&self, handle: &str, command: &str) -> Result<ExecOutput, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(handle, error = %e, "exec stream error"),
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn interrupt(&self, handle: &str) -> Result<(), RuntimeError> {
        // restart with t=0 kills every process while keeping the
        // container and its filesystem for forensics
        self.docker
            .restart_container(handle, Some(RestartContainerOptions { t: 0 }))
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;
        warn!(handle, "container interrupted");
        Ok(())
    }

    async fn snapshot(&self, handle: &str, tag: &str) -> Result<String, RuntimeError> {
        let commit = self
            .docker
            .commit_container(
                CommitContainerOptions {
                    container: handle.to_string(),
                    repo: "rangeguard-snap".to_string(),
                    tag: tag.to_string(),
                    ..Default::default()
                },
                Config::<String>::default(),
            )
            .await
            .map_err(|e| RuntimeError::SnapshotFailed(e.to_string()))?;

        let image_ref = format!("rangeguard-snap:{}", tag);
        info!(handle, image = %image_ref, id = %commit.id.as_deref().unwrap_or(""), "snapshot committed");
        Ok(image_ref)
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }
}
