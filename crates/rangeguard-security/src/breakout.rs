//! Breakout monitor: container-escape signature scan
//!
//! Independent from the command validator's deny patterns and evaluated
//! unconditionally, even for commands the validator already allowed. A
//! match is always CRITICAL: the pipeline quarantines the container,
//! blocks the user and raises an alert.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

use rangeguard_core::BreakoutConfig;

use crate::types::{DecidingLayer, DenyCode, SecurityError, ThreatLevel, ValidationVerdict};

/// Bump when the built-in signature table changes.
pub const SIGNATURE_SET_VERSION: u32 = 3;

/// Response taken when a signature matches.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Quarantine the container and block the user
    QuarantineAndBlock,
    /// Alert only; used for deployment-specific watch patterns
    Alert,
}

#[derive(Debug, Clone)]
pub struct BreakoutSignature {
    pub id: String,
    pub pattern: Regex,
    pub description: String,
    pub threat_level: ThreatLevel,
    pub action: ResponseAction,
}

impl BreakoutSignature {
    fn builtin(id: &str, pattern: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            // patterns target normalized text: lowercased, single spaces
            pattern: Regex::new(pattern).expect("builtin signature must compile"),
            description: description.to_string(),
            threat_level: ThreatLevel::Critical,
            action: ResponseAction::QuarantineAndBlock,
        }
    }
}

static BUILTIN_SIGNATURES: Lazy<Vec<BreakoutSignature>> = Lazy::new(|| {
    vec![
        BreakoutSignature::builtin(
            "runtime-socket",
            r"(docker|containerd|crio?)\.sock|/run/containerd|/var/run/docker",
            "container runtime control socket access",
        ),
        BreakoutSignature::builtin(
            "runtime-cli",
            r"\b(docker|podman|kubectl|crictl|runc|ctr|nerdctl)\b",
            "container runtime CLI invocation",
        ),
        BreakoutSignature::builtin(
            "ns-manipulation",
            r"\b(nsenter|unshare|setns)\b",
            "namespace manipulation",
        ),
        BreakoutSignature::builtin(
            "host-init-proc",
            r"/proc/1/(root|ns|environ|cwd|exe|mem|fd)",
            "host init process proc entry access",
        ),
        BreakoutSignature::builtin(
            "suid-bit",
            r"chmod\s+(u\+s|g\+s|\+s|[0-7]?[4567][0-7]{3})\b",
            "SUID bit manipulation",
        ),
        BreakoutSignature::builtin(
            "cgroup-release-agent",
            r"release_agent|notify_on_release",
            "cgroup release-agent abuse",
        ),
        BreakoutSignature::builtin(
            "bind-mount",
            r"mount\s+(-o\s+r?bind|--r?bind)|/sys/fs/cgroup",
            "bind mount outside sandbox root",
        ),
        BreakoutSignature::builtin(
            "privileged-flag",
            r"--privileged|--pid[= ]host|--net[= ]host|--cap-add",
            "privileged container flags",
        ),
        BreakoutSignature::builtin(
            "core-pattern",
            r"/proc/sys/kernel/(core_pattern|modprobe)",
            "kernel helper path overwrite",
        ),
    ]
});

/// Execution context accompanying a command into the monitor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub user_id: String,
    pub container_id: String,
}

pub struct BreakoutMonitor {
    signatures: RwLock<Arc<Vec<BreakoutSignature>>>,
}

impl BreakoutMonitor {
    pub fn new(config: &BreakoutConfig) -> Result<Self, SecurityError> {
        Ok(Self {
            signatures: RwLock::new(Arc::new(Self::compile(config)?)),
        })
    }

    fn compile(config: &BreakoutConfig) -> Result<Vec<BreakoutSignature>, SecurityError> {
        let mut signatures = BUILTIN_SIGNATURES.clone();
        for (i, pattern) in config.extra_signatures.iter().enumerate() {
            let compiled = Regex::new(pattern).map_err(|source| SecurityError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            signatures.push(BreakoutSignature {
                id: format!("extra-{}", i),
                pattern: compiled,
                description: format!("deployment signature {}", pattern),
                threat_level: ThreatLevel::Critical,
                action: ResponseAction::QuarantineAndBlock,
            });
        }
        Ok(signatures)
    }

    pub async fn reload(&self, config: &BreakoutConfig) -> Result<(), SecurityError> {
        let signatures = Arc::new(Self::compile(config)?);
        *self.signatures.write().await = signatures;
        debug!("breakout signature set reloaded");
        Ok(())
    }

    /// Scan one command. Matching is case-insensitive and collapses runs
    /// of whitespace, so `DoCkEr   ps` still hits the runtime-cli
    /// signature.
    pub async fn inspect(&self, command: &str, ctx: &ExecutionContext) -> ValidationVerdict {
        let signatures = self.signatures.read().await.clone();
        let normalized = normalize(command);

        for signature in signatures.iter() {
            if signature.pattern.is_match(&normalized) {
                error!(
                    user = %ctx.user_id,
                    container = %ctx.container_id,
                    signature = %signature.id,
                    command = %normalized,
                    "breakout attempt detected"
                );
                return ValidationVerdict::deny(
                    DecidingLayer::Breakout,
                    DenyCode::BreakoutDetected,
                    signature.threat_level,
                    format!("{} ({})", signature.description, signature.id),
                );
            }
        }

        ValidationVerdict::allow()
    }

    /// The signature that matched, if any. Used by the pipeline to pick
    /// the response action.
    pub async fn matched_signature(&self, command: &str) -> Option<BreakoutSignature> {
        let signatures = self.signatures.read().await.clone();
        let normalized = normalize(command);
        signatures
            .iter()
            .find(|s| s.pattern.is_match(&normalized))
            .cloned()
    }
}

fn normalize(command: &str) -> String {
    command
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BreakoutMonitor {
        BreakoutMonitor::new(&BreakoutConfig::default()).unwrap()
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            user_id: "alice".to_string(),
            container_id: "c-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_benign_command_passes() {
        let verdict = monitor().inspect("nmap -sS 172.25.0.10", &ctx()).await;
        assert!(verdict.is_allow());
    }

    #[tokio::test]
    async fn test_docker_cli_is_critical() {
        let verdict = monitor().inspect("docker ps", &ctx()).await;
        assert_eq!(verdict.code, Some(DenyCode::BreakoutDetected));
        assert_eq!(verdict.threat_level, ThreatLevel::Critical);
        assert_eq!(verdict.layer, Some(DecidingLayer::Breakout));
    }

    #[tokio::test]
    async fn test_obfuscation_by_case_and_whitespace() {
        let monitor = monitor();
        for cmd in [
            "DOCKER   ps",
            "NsEnTeR -t 1 -m",
            "cat   /PROC/1/ENVIRON",
            "chmod  U+S /bin/bash",
        ] {
            let verdict = monitor.inspect(cmd, &ctx()).await;
            assert_eq!(
                verdict.code,
                Some(DenyCode::BreakoutDetected),
                "expected breakout verdict for {:?}",
                cmd
            );
        }
    }

    #[tokio::test]
    async fn test_runtime_socket_signature() {
        let verdict = monitor()
            .inspect("curl --unix-socket /var/run/docker.sock http://x/containers", &ctx())
            .await;
        assert_eq!(verdict.code, Some(DenyCode::BreakoutDetected));
    }

    #[tokio::test]
    async fn test_cgroup_release_agent() {
        let verdict = monitor()
            .inspect("echo /tmp/pwn > /sys/fs/cgroup/release_agent", &ctx())
            .await;
        assert_eq!(verdict.code, Some(DenyCode::BreakoutDetected));
    }

    #[tokio::test]
    async fn test_bind_mount_signature() {
        let verdict = monitor().inspect("mount --bind /host /mnt", &ctx()).await;
        assert_eq!(verdict.code, Some(DenyCode::BreakoutDetected));
    }

    #[tokio::test]
    async fn test_extra_signature_from_config() {
        let config = BreakoutConfig {
            extra_signatures: vec![r"\bfirecracker\b".to_string()],
        };
        let monitor = BreakoutMonitor::new(&config).unwrap();
        let verdict = monitor.inspect("firecracker --api-sock /tmp/fc", &ctx()).await;
        assert_eq!(verdict.code, Some(DenyCode::BreakoutDetected));
    }

    #[tokio::test]
    async fn test_matched_signature_lookup() {
        let signature = monitor().matched_signature("docker ps").await.unwrap();
        assert_eq!(signature.id, "runtime-cli");
        assert_eq!(signature.action, ResponseAction::QuarantineAndBlock);
    }

    #[tokio::test]
    async fn test_invalid_extra_signature_rejected() {
        let config = BreakoutConfig {
            extra_signatures: vec!["(".to_string()],
        };
        assert!(BreakoutMonitor::new(&config).is_err());
    }
}
