//! Container lifecycle manager
//!
//! Owns the per-container state machine:
//! `Provisioning -> Running -> {Quarantined, Terminated}`,
//! `Quarantined -> Terminated`. Every transition re-validates the current
//! state under the container's lock, so quarantine and terminate racing
//! with an in-flight execution resolve deterministically in their favor.
//! Other components reference containers by identifier only.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use rangeguard_core::{
    ContainerId, LifecycleConfig, NetworkSegment, RangeGuardError, ResourceCeiling, SessionId,
    SnapshotId, UserId,
};
use rangeguard_security::{AuditError, AuditEvent, AuditLog, AuditOutcome, ThreatLevel};

use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("session '{0}' already has a live container")]
    SessionActive(SessionId),

    #[error("container not found: {0}")]
    NotFound(ContainerId),

    #[error("container quarantined: {0}")]
    Quarantined(ContainerId),

    #[error("container terminated: {0}")]
    Terminated(ContainerId),

    #[error("container busy: {0}")]
    Busy(ContainerId),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl From<LifecycleError> for RangeGuardError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::SessionActive(s) => {
                RangeGuardError::Provision(format!("session '{}' already active", s))
            }
            LifecycleError::NotFound(id) => RangeGuardError::ContainerNotFound(id),
            LifecycleError::Quarantined(id) => RangeGuardError::ContainerQuarantined(id),
            // snapshot/exec against a terminated container is a
            // provisioning-class failure for the caller
            LifecycleError::Terminated(id) => {
                RangeGuardError::Provision(format!("container '{}' is terminated", id))
            }
            LifecycleError::Busy(id) => RangeGuardError::ContainerBusy(id),
            LifecycleError::SnapshotNotFound(id) => RangeGuardError::SnapshotNotFound(id),
            LifecycleError::Provision(msg) => RangeGuardError::Provision(msg),
            LifecycleError::Runtime(e) => RangeGuardError::RuntimeUnavailable(e.to_string()),
            LifecycleError::Audit(e) => RangeGuardError::AuditUnavailable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Provisioning,
    Running,
    Quarantined,
    Terminated,
}

/// One provisioned sandbox. Network segment and resource ceiling are
/// immutable after provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxContainer {
    pub id: ContainerId,
    pub session_id: SessionId,
    pub owner_id: UserId,
    pub runtime_handle: String,
    pub ceiling: ResourceCeiling,
    pub segment: NetworkSegment,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub parent_snapshot: Option<SnapshotId>,
}

/// Point-in-time capture of a container filesystem; read-only once taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub name: String,
    pub source_container: ContainerId,
    pub image_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Exclusive right to run one command in a container. Holds the
/// per-container execution lock until dropped; a concurrent request
/// against the same container fails fast with [`LifecycleError::Busy`].
#[derive(Debug)]
pub struct ExecGrant {
    pub container_id: ContainerId,
    pub runtime_handle: String,
    _permit: OwnedMutexGuard<()>,
}

pub struct ContainerLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    audit: Arc<AuditLog>,
    config: LifecycleConfig,
    containers: RwLock<HashMap<ContainerId, Arc<Mutex<SandboxContainer>>>>,
    exec_guards: RwLock<HashMap<ContainerId, Arc<Mutex<()>>>>,
    snapshots: RwLock<HashMap<SnapshotId, Snapshot>>,
    /// Serializes provisioning so session uniqueness holds under races.
    provision_lock: Mutex<()>,
}

impl ContainerLifecycle {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        audit: Arc<AuditLog>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            runtime,
            audit,
            config,
            containers: RwLock::new(HashMap::new()),
            exec_guards: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            provision_lock: Mutex::new(()),
        }
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    fn network_for(&self, segment: NetworkSegment) -> String {
        match segment {
            NetworkSegment::Training => self.config.training_network.clone(),
            NetworkSegment::Isolated => self.config.isolated_network.clone(),
        }
    }

    async fn record(&self, id: &str) -> Result<Arc<Mutex<SandboxContainer>>, LifecycleError> {
        self.containers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Provision a fresh sandbox bound to `session_id`. At most one
    /// non-terminated container may exist per session.
    pub async fn provision(
        &self,
        session_id: &str,
        owner_id: &str,
        ceiling: ResourceCeiling,
        segment: NetworkSegment,
    ) -> Result<SandboxContainer, LifecycleError> {
        self.provision_inner(session_id, owner_id, ceiling, segment, None)
            .await
    }

    /// Provision a new container seeded from a snapshot; same state
    /// machine as `provision`.
    pub async fn restore(
        &self,
        snapshot_id: &str,
        session_id: &str,
        owner_id: &str,
        ceiling: ResourceCeiling,
        segment: NetworkSegment,
    ) -> Result<SandboxContainer, LifecycleError> {
        let snapshot = self
            .snapshots
            .read()
            .await
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| LifecycleError::SnapshotNotFound(snapshot_id.to_string()))?;
        self.provision_inner(session_id, owner_id, ceiling, segment, Some(snapshot))
            .await
    }

    async fn provision_inner(
        &self,
        session_id: &str,
        owner_id: &str,
        ceiling: ResourceCeiling,
        segment: NetworkSegment,
        seed: Option<Snapshot>,
    ) -> Result<SandboxContainer, LifecycleError> {
        let _serialize = self.provision_lock.lock().await;

        // terminated history does not count against session uniqueness
        if self.live_by_session(session_id).await.is_some() {
            return Err(LifecycleError::SessionActive(session_id.to_string()));
        }

        let id = format!("sbx-{}", Uuid::new_v4());
        let now = Utc::now();
        let container = SandboxContainer {
            id: id.clone(),
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
            runtime_handle: String::new(),
            ceiling,
            segment,
            state: ContainerState::Provisioning,
            created_at: now,
            last_activity: now,
            parent_snapshot: seed.as_ref().map(|s| s.id.clone()),
        };

        let record = Arc::new(Mutex::new(container));
        self.containers.write().await.insert(id.clone(), record.clone());

        let spec = ContainerSpec {
            name: id.clone(),
            image: self.config.image.clone(),
            ceiling,
            network: self.network_for(segment),
            seed_image: seed.as_ref().map(|s| s.image_ref.clone()),
        };

        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.containers.write().await.remove(&id);
                warn!(session = %session_id, error = %e, "provisioning failed");
                return Err(LifecycleError::Provision(e.to_string()));
            }
        };

        {
            let mut container = record.lock().await;
            container.runtime_handle = handle;
            container.state = ContainerState::Running;
        }

        let mut detail = format!("session={} segment={}", session_id, segment);
        if let Some(snapshot) = &seed {
            detail.push_str(&format!(" snapshot={}", snapshot.id));
        }
        self.audit
            .append(
                AuditEvent::new(owner_id, AuditOutcome::Admin, "CONTAINER_PROVISIONED")
                    .with_container(&id)
                    .with_detail(&detail),
            )
            .await?;

        info!(container = %id, session = %session_id, segment = %segment, "container provisioned");
        let provisioned = record.lock().await.clone();
        Ok(provisioned)
    }

    /// Running -> Quarantined. Idempotent for an already-quarantined
    /// container; invalid once terminated. Preempts any in-flight
    /// execution by interrupting the runtime container.
    pub async fn quarantine(&self, id: &str, reason: &str) -> Result<(), LifecycleError> {
        let record = self.record(id).await?;
        let handle = {
            let mut container = record.lock().await;
            match container.state {
                ContainerState::Quarantined => return Ok(()),
                ContainerState::Terminated => {
                    return Err(LifecycleError::Terminated(id.to_string()))
                }
                ContainerState::Provisioning | ContainerState::Running => {}
            }
            container.state = ContainerState::Quarantined;
            container.runtime_handle.clone()
        };

        if let Err(e) = self.runtime.interrupt(&handle).await {
            warn!(container = %id, error = %e, "interrupt on quarantine failed");
        }

        self.audit
            .append(
                AuditEvent::new("system", AuditOutcome::Admin, "CONTAINER_QUARANTINED")
                    .with_container(id)
                    .with_threat(ThreatLevel::Critical)
                    .with_detail(reason),
            )
            .await?;

        warn!(container = %id, reason, "container quarantined");
        Ok(())
    }

    /// Destroy the container and free its resources. Idempotent: a
    /// second call on a terminated container is a no-op and appends no
    /// duplicate audit event.
    pub async fn terminate(&self, id: &str) -> Result<(), LifecycleError> {
        let record = self.record(id).await?;
        let handle = {
            let mut container = record.lock().await;
            if container.state == ContainerState::Terminated {
                return Ok(());
            }
            container.state = ContainerState::Terminated;
            container.runtime_handle.clone()
        };

        // termination stands even when the runtime has already lost the
        // container
        if let Err(e) = self.runtime.destroy(&handle).await {
            warn!(container = %id, error = %e, "destroy failed");
        }
        self.exec_guards.write().await.remove(id);

        self.audit
            .append(
                AuditEvent::new("system", AuditOutcome::Admin, "CONTAINER_TERMINATED")
                    .with_container(id),
            )
            .await?;

        info!(container = %id, "container terminated");
        Ok(())
    }

    /// Capture current filesystem state without interrupting execution.
    /// Allowed while Running or Quarantined (forensics); fails once
    /// Terminated.
    pub async fn snapshot(&self, id: &str, name: &str) -> Result<Snapshot, LifecycleError> {
        let record = self.record(id).await?;
        let handle = {
            let container = record.lock().await;
            if container.state == ContainerState::Terminated {
                return Err(LifecycleError::Terminated(id.to_string()));
            }
            container.runtime_handle.clone()
        };

        let snapshot_id = format!("snap-{}", Uuid::new_v4());
        let tag = snapshot_id.trim_start_matches("snap-").to_string();
        let image_ref = self.runtime.snapshot(&handle, &tag).await?;

        let snapshot = Snapshot {
            id: snapshot_id.clone(),
            name: name.to_string(),
            source_container: id.to_string(),
            image_ref,
            created_at: Utc::now(),
        };
        self.snapshots
            .write()
            .await
            .insert(snapshot_id.clone(), snapshot.clone());

        self.audit
            .append(
                AuditEvent::new("system", AuditOutcome::Admin, "SNAPSHOT_CREATED")
                    .with_container(id)
                    .with_detail(&format!("snapshot={} name={}", snapshot_id, name)),
            )
            .await?;

        info!(container = %id, snapshot = %snapshot_id, "snapshot created");
        Ok(snapshot)
    }

    /// Acquire the exclusive execution slot for a Running container.
    pub async fn begin_exec(&self, id: &str) -> Result<ExecGrant, LifecycleError> {
        let record = self.record(id).await?;
        let handle = {
            let container = record.lock().await;
            match container.state {
                ContainerState::Running => container.runtime_handle.clone(),
                ContainerState::Quarantined => {
                    return Err(LifecycleError::Quarantined(id.to_string()))
                }
                ContainerState::Terminated => {
                    return Err(LifecycleError::Terminated(id.to_string()))
                }
                ContainerState::Provisioning => {
                    return Err(LifecycleError::Provision(format!(
                        "container '{}' still provisioning",
                        id
                    )))
                }
            }
        };

        let guard = {
            let mut guards = self.exec_guards.write().await;
            guards
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let permit = guard
            .try_lock_owned()
            .map_err(|_| LifecycleError::Busy(id.to_string()))?;

        Ok(ExecGrant {
            container_id: id.to_string(),
            runtime_handle: handle,
            _permit: permit,
        })
    }

    /// Refresh the last-activity timestamp feeding the idle sweep.
    pub async fn touch(&self, id: &str) {
        if let Ok(record) = self.record(id).await {
            record.lock().await.last_activity = Utc::now();
        }
    }

    /// Terminate containers idle past the configured max age. Returns
    /// the identifiers that were swept. Terminated records older than
    /// the same cutoff are dropped entirely, so history stays bounded.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<ContainerId> {
        let cutoff = now - Duration::seconds(self.config.idle_max_secs);
        let mut stale = Vec::new();
        let mut expired = Vec::new();
        {
            let containers = self.containers.read().await;
            for (id, record) in containers.iter() {
                let container = record.lock().await;
                if container.last_activity >= cutoff {
                    continue;
                }
                if container.state == ContainerState::Terminated {
                    expired.push(id.clone());
                } else {
                    stale.push(id.clone());
                }
            }
        }

        if !expired.is_empty() {
            let mut containers = self.containers.write().await;
            for id in &expired {
                containers.remove(id);
            }
            info!(count = expired.len(), "dropped stale terminated records");
        }

        let mut swept = Vec::new();
        for id in stale {
            match self.terminate(&id).await {
                Ok(()) => swept.push(id),
                Err(e) => warn!(container = %id, error = %e, "idle sweep terminate failed"),
            }
        }
        if !swept.is_empty() {
            info!(count = swept.len(), "idle sweep terminated containers");
        }
        swept
    }

    pub async fn get(&self, id: &str) -> Option<SandboxContainer> {
        let record = self.record(id).await.ok()?;
        let container = record.lock().await;
        Some(container.clone())
    }

    pub async fn find_by_session(&self, session_id: &str) -> Option<SandboxContainer> {
        let containers = self.containers.read().await;
        for record in containers.values() {
            let container = record.lock().await;
            if container.session_id == session_id {
                return Some(container.clone());
            }
        }
        None
    }

    /// Live container for a session, ignoring terminated history.
    pub async fn live_by_session(&self, session_id: &str) -> Option<SandboxContainer> {
        let containers = self.containers.read().await;
        for record in containers.values() {
            let container = record.lock().await;
            if container.session_id == session_id
                && container.state != ContainerState::Terminated
            {
                return Some(container.clone());
            }
        }
        None
    }

    pub async fn list(&self) -> Vec<SandboxContainer> {
        let containers = self.containers.read().await;
        let mut all = Vec::new();
        for record in containers.values() {
            all.push(record.lock().await.clone());
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn get_snapshot(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.read().await.get(id).cloned()
    }
}
