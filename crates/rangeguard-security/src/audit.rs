//! Append-only audit log
//!
//! Every pipeline run and lifecycle transition appends exactly one event.
//! Sequence numbers are monotonic and gapless; appends serialize on the
//! write lock, queries share the read lock. Events are never dropped in
//! normal operation; only the explicitly invoked retention sweep removes
//! them, and the sweep itself is recorded.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use rangeguard_core::{AuditConfig, ContainerId, UserId};

use crate::types::ThreatLevel;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit buffer full ({0} events); run the retention sweep")]
    BufferFull(usize),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    /// Command passed all layers and was dispatched
    AllowedExecuted,
    /// Denied by a mediation layer
    Blocked,
    /// Runtime-level failure (timeout, unreachable container)
    Error,
    /// Administrative record (lifecycle transition, retention sweep)
    Admin,
}

/// Immutable audit record. `seq` is assigned by [`AuditLog::append`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub user_id: UserId,
    pub container_id: Option<ContainerId>,
    pub command: String,
    /// Stable verdict code: "ALLOW", a deny code, or an admin action
    pub verdict: String,
    pub threat_level: ThreatLevel,
    pub outcome: AuditOutcome,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(user_id: &str, outcome: AuditOutcome, verdict: &str) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            container_id: None,
            command: String::new(),
            verdict: verdict.to_string(),
            threat_level: ThreatLevel::Low,
            outcome,
            duration_ms: None,
            detail: None,
        }
    }

    pub fn with_container(mut self, container_id: &str) -> Self {
        self.container_id = Some(container_id.to_string());
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = command.to_string();
        self
    }

    pub fn with_threat(mut self, level: ThreatLevel) -> Self {
        self.threat_level = level;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

/// Query filters; all optional, combined with AND. Results come back in
/// ascending sequence order; paginate with `after_seq` + `limit`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<UserId>,
    pub container_id: Option<ContainerId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub outcome: Option<AuditOutcome>,
    pub min_threat: Option<ThreatLevel>,
    pub after_seq: Option<u64>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(user) = &self.user_id {
            if &event.user_id != user {
                return false;
            }
        }
        if let Some(container) = &self.container_id {
            if event.container_id.as_ref() != Some(container) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp > to {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if event.outcome != outcome {
                return false;
            }
        }
        if let Some(min) = self.min_threat {
            if event.threat_level < min {
                return false;
            }
        }
        true
    }
}

/// Cumulative counters maintained on append; unaffected by retention.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total: u64,
    pub by_outcome: HashMap<AuditOutcome, u64>,
    pub by_threat: HashMap<ThreatLevel, u64>,
    pub denials_by_user: HashMap<UserId, u64>,
}

struct LogState {
    next_seq: u64,
    events: VecDeque<AuditEvent>,
    stats: AuditStats,
}

pub struct AuditLog {
    state: RwLock<LogState>,
    max_events: usize,
    retention: Duration,
}

impl AuditLog {
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            state: RwLock::new(LogState {
                next_seq: 1,
                events: VecDeque::new(),
                stats: AuditStats::default(),
            }),
            max_events: config.max_events,
            retention: Duration::days(config.retention_days),
        }
    }

    /// Append one event and return its sequence number. Fails when the
    /// buffer is full: a command that cannot be audited must not be
    /// treated as executed.
    pub async fn append(&self, mut event: AuditEvent) -> Result<u64, AuditError> {
        let mut state = self.state.write().await;

        if state.events.len() >= self.max_events {
            error!(cap = self.max_events, "audit buffer full, failing closed");
            return Err(AuditError::BufferFull(self.max_events));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        event.seq = seq;

        state.stats.total += 1;
        *state.stats.by_outcome.entry(event.outcome).or_insert(0) += 1;
        *state.stats.by_threat.entry(event.threat_level).or_insert(0) += 1;
        if event.outcome == AuditOutcome::Blocked {
            *state
                .stats
                .denials_by_user
                .entry(event.user_id.clone())
                .or_insert(0) += 1;
        }

        match event.threat_level {
            ThreatLevel::Critical => error!(seq, verdict = %event.verdict, user = %event.user_id, "audit"),
            ThreatLevel::High => warn!(seq, verdict = %event.verdict, user = %event.user_id, "audit"),
            _ => debug!(seq, verdict = %event.verdict, user = %event.user_id, "audit"),
        }

        state.events.push_back(event);
        Ok(seq)
    }

    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let state = self.state.read().await;
        let after = query.after_seq.unwrap_or(0);
        let limit = query.limit.unwrap_or(100);

        state
            .events
            .iter()
            .filter(|e| e.seq > after)
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Explicitly invoked retention sweep: removes events older than the
    /// retention period and records the sweep itself. Returns the number
    /// of expired events.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<usize, AuditError> {
        let cutoff = now - self.retention;
        let expired = {
            let mut state = self.state.write().await;
            let mut expired = 0;
            while state.events.front().is_some_and(|e| e.timestamp < cutoff) {
                state.events.pop_front();
                expired += 1;
            }
            expired
        };

        if expired > 0 {
            info!(expired, cutoff = %cutoff, "audit retention sweep");
        }
        self.append(
            AuditEvent::new("system", AuditOutcome::Admin, "RETENTION_SWEEP")
                .with_detail(&format!("expired {} events", expired)),
        )
        .await?;

        Ok(expired)
    }

    pub async fn stats(&self) -> AuditStats {
        self.state.read().await.stats.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> AuditLog {
        AuditLog::new(&AuditConfig::default())
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic_and_gapless() {
        let log = log();
        let mut last = 0;
        for i in 0..50 {
            let seq = log
                .append(AuditEvent::new(&format!("user-{}", i % 3), AuditOutcome::Blocked, "NOT_WHITELISTED"))
                .await
                .unwrap();
            assert_eq!(seq, last + 1);
            last = seq;
        }

        let events = log.query(&AuditQuery { limit: Some(100), ..Default::default() }).await;
        for pair in events.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
        }
    }

    #[tokio::test]
    async fn test_query_filters() {
        let log = log();
        log.append(
            AuditEvent::new("alice", AuditOutcome::AllowedExecuted, "ALLOW").with_container("c-1"),
        )
        .await
        .unwrap();
        log.append(
            AuditEvent::new("bob", AuditOutcome::Blocked, "BREAKOUT_DETECTED")
                .with_container("c-2")
                .with_threat(ThreatLevel::Critical),
        )
        .await
        .unwrap();

        let for_bob = log
            .query(&AuditQuery { user_id: Some("bob".to_string()), ..Default::default() })
            .await;
        assert_eq!(for_bob.len(), 1);
        assert_eq!(for_bob[0].verdict, "BREAKOUT_DETECTED");

        let critical = log
            .query(&AuditQuery { min_threat: Some(ThreatLevel::Critical), ..Default::default() })
            .await;
        assert_eq!(critical.len(), 1);

        let for_container = log
            .query(&AuditQuery { container_id: Some("c-1".to_string()), ..Default::default() })
            .await;
        assert_eq!(for_container.len(), 1);
        assert_eq!(for_container[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_pagination_restarts_from_seq() {
        let log = log();
        for _ in 0..10 {
            log.append(AuditEvent::new("alice", AuditOutcome::Blocked, "NOT_WHITELISTED"))
                .await
                .unwrap();
        }

        let page1 = log
            .query(&AuditQuery { limit: Some(4), ..Default::default() })
            .await;
        assert_eq!(page1.len(), 4);

        let page2 = log
            .query(&AuditQuery {
                after_seq: Some(page1.last().unwrap().seq),
                limit: Some(4),
                ..Default::default()
            })
            .await;
        assert_eq!(page2.len(), 4);
        assert_eq!(page2[0].seq, page1.last().unwrap().seq + 1);
    }

    #[tokio::test]
    async fn test_append_fails_closed_when_full() {
        let log = AuditLog::new(&AuditConfig { max_events: 2, retention_days: 90 });
        log.append(AuditEvent::new("a", AuditOutcome::Blocked, "X")).await.unwrap();
        log.append(AuditEvent::new("a", AuditOutcome::Blocked, "X")).await.unwrap();
        let err = log.append(AuditEvent::new("a", AuditOutcome::Blocked, "X")).await;
        assert!(matches!(err, Err(AuditError::BufferFull(2))));
    }

    #[tokio::test]
    async fn test_expire_removes_old_and_audits_itself() {
        let log = AuditLog::new(&AuditConfig { max_events: 100, retention_days: 90 });

        let mut old = AuditEvent::new("alice", AuditOutcome::Blocked, "NOT_WHITELISTED");
        old.timestamp = Utc::now() - Duration::days(120);
        log.append(old).await.unwrap();
        log.append(AuditEvent::new("alice", AuditOutcome::AllowedExecuted, "ALLOW"))
            .await
            .unwrap();

        let expired = log.expire(Utc::now()).await.unwrap();
        assert_eq!(expired, 1);

        let events = log.query(&AuditQuery::default()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().unwrap().verdict, "RETENTION_SWEEP");
        assert_eq!(events.last().unwrap().outcome, AuditOutcome::Admin);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let log = log();
        log.append(AuditEvent::new("alice", AuditOutcome::Blocked, "NOT_WHITELISTED"))
            .await
            .unwrap();
        log.append(AuditEvent::new("alice", AuditOutcome::Blocked, "DANGEROUS_PATTERN"))
            .await
            .unwrap();
        log.append(AuditEvent::new("bob", AuditOutcome::AllowedExecuted, "ALLOW"))
            .await
            .unwrap();

        let stats = log.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_outcome[&AuditOutcome::Blocked], 2);
        assert_eq!(stats.denials_by_user["alice"], 2);
    }
}
