//! Notification sink for CRITICAL-level incidents

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub user_id: String,
    pub container_id: String,
    pub signature: String,
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

/// Collaborator interface for incident notifications. The core publishes
/// breakout detections here; delivery (pager, chat, SIEM) is the
/// implementor's concern.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn critical(&self, alert: &SecurityAlert);
}

/// Default sink: structured error log.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn critical(&self, alert: &SecurityAlert) {
        error!(
            user = %alert.user_id,
            container = %alert.container_id,
            signature = %alert.signature,
            command = %alert.command,
            "SECURITY ALERT: breakout attempt"
        );
    }
}

/// In-memory sink for test suites.
#[derive(Default)]
pub struct CollectingSink {
    alerts: tokio::sync::Mutex<Vec<SecurityAlert>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<SecurityAlert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn critical(&self, alert: &SecurityAlert) {
        self.alerts.lock().await.push(alert.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collecting_sink_records() {
        let sink = CollectingSink::new();
        sink.critical(&SecurityAlert {
            user_id: "alice".to_string(),
            container_id: "c-1".to_string(),
            signature: "runtime-cli".to_string(),
            command: "docker ps".to_string(),
            timestamp: Utc::now(),
        })
        .await;
        assert_eq!(sink.alerts().await.len(), 1);
        assert_eq!(sink.alerts().await[0].signature, "runtime-cli");
    }
}
