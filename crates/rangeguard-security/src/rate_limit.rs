//! Per-user sliding-window rate limiter
//!
//! Each user owns one [`RateWindow`] behind its own mutex: the
//! check-and-record step is a single atomic operation per user, so two
//! concurrent requests can never both observe `count == N-1` and both
//! proceed. Unrelated users never contend.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use rangeguard_core::{RateLimitConfig, UserId};

use crate::types::{DecidingLayer, DenyCode, ThreatLevel, ValidationVerdict};

/// Counter state for one user. Timestamps older than the window are
/// pruned lazily on each acquire.
#[derive(Debug, Default)]
pub struct RateWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: RwLock<HashMap<UserId, Arc<Mutex<RateWindow>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    async fn window(&self, user_id: &str) -> Arc<Mutex<RateWindow>> {
        {
            let windows = self.windows.read().await;
            if let Some(window) = windows.get(user_id) {
                return window.clone();
            }
        }
        let mut windows = self.windows.write().await;
        windows
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateWindow::default())))
            .clone()
    }

    /// Atomic check-and-record. Allows and records the request when the
    /// window has room; otherwise denies and starts the cooldown block.
    /// While a block is active the deny is immediate, without pruning.
    pub async fn try_acquire(&self, user_id: &str, now: DateTime<Utc>) -> ValidationVerdict {
        let window = self.window(user_id).await;
        let mut window = window.lock().await;

        if let Some(until) = window.blocked_until {
            if until > now {
                return ValidationVerdict::deny(
                    DecidingLayer::RateLimit,
                    DenyCode::RateLimitExceeded,
                    ThreatLevel::Low,
                    format!("user '{}' blocked until {}", user_id, until.to_rfc3339()),
                );
            }
            window.blocked_until = None;
        }

        let cutoff = now - Duration::seconds(self.config.window_secs as i64);
        while window.timestamps.front().is_some_and(|t| *t < cutoff) {
            window.timestamps.pop_front();
        }

        if window.timestamps.len() >= self.config.max_requests {
            let until = now + Duration::seconds(self.config.cooldown_secs as i64);
            window.blocked_until = Some(until);
            warn!(user = %user_id, until = %until, "rate limit exceeded");
            return ValidationVerdict::deny(
                DecidingLayer::RateLimit,
                DenyCode::RateLimitExceeded,
                ThreatLevel::Low,
                format!(
                    "{} requests within {}s, blocked for {}s",
                    self.config.max_requests, self.config.window_secs, self.config.cooldown_secs
                ),
            );
        }

        window.timestamps.push_back(now);
        ValidationVerdict::allow()
    }

    /// Administrative or incident-response block. Breakout detection uses
    /// a far-future `until` so the next request is denied deterministically.
    pub async fn block(&self, user_id: &str, until: DateTime<Utc>) {
        let window = self.window(user_id).await;
        window.lock().await.blocked_until = Some(until);
        warn!(user = %user_id, until = %until, "user blocked");
    }

    /// Clear a block. Returns false when the user had none.
    pub async fn unblock(&self, user_id: &str) -> bool {
        let window = {
            let windows = self.windows.read().await;
            windows.get(user_id).cloned()
        };
        let Some(window) = window else {
            return false;
        };
        let mut window = window.lock().await;
        let had_block = window.blocked_until.is_some();
        window.blocked_until = None;
        if had_block {
            info!(user = %user_id, "user unblocked");
        }
        had_block
    }

    /// Users with an active block, for the security report.
    pub async fn active_blocks(&self, now: DateTime<Utc>) -> Vec<(UserId, DateTime<Utc>)> {
        let windows = self.windows.read().await;
        let mut blocks = Vec::new();
        for (user, window) in windows.iter() {
            let window = window.lock().await;
            if let Some(until) = window.blocked_until {
                if until > now {
                    blocks.push((user.clone(), until));
                }
            }
        }
        blocks.sort();
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_secs: u64, max: usize, cooldown: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window_secs,
            max_requests: max,
            cooldown_secs: cooldown,
        })
    }

    #[tokio::test]
    async fn test_window_boundary_100_then_101() {
        let limiter = limiter(300, 100, 60);
        let now = Utc::now();

        for i in 0..100 {
            let verdict = limiter.try_acquire("alice", now).await;
            assert!(verdict.is_allow(), "request {} should pass", i);
        }

        let verdict = limiter.try_acquire("alice", now).await;
        assert_eq!(verdict.code, Some(DenyCode::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_window_slides_after_expiry() {
        let limiter = limiter(300, 2, 1);
        let start = Utc::now();

        assert!(limiter.try_acquire("alice", start).await.is_allow());
        assert!(limiter.try_acquire("alice", start).await.is_allow());
        assert!(!limiter.try_acquire("alice", start).await.is_allow());

        // past both the cooldown and the earliest recorded timestamp
        let later = start + Duration::seconds(301);
        assert!(limiter.try_acquire("alice", later).await.is_allow());
    }

    #[tokio::test]
    async fn test_block_fast_path() {
        let limiter = limiter(300, 1, 60);
        let now = Utc::now();

        assert!(limiter.try_acquire("alice", now).await.is_allow());
        assert!(!limiter.try_acquire("alice", now).await.is_allow());

        // still inside the cooldown
        let verdict = limiter.try_acquire("alice", now + Duration::seconds(30)).await;
        assert_eq!(verdict.code, Some(DenyCode::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let limiter = limiter(300, 1, 60);
        let now = Utc::now();

        assert!(limiter.try_acquire("alice", now).await.is_allow());
        assert!(!limiter.try_acquire("alice", now).await.is_allow());
        assert!(limiter.try_acquire("bob", now).await.is_allow());
    }

    #[tokio::test]
    async fn test_admin_block_and_unblock() {
        let limiter = limiter(300, 100, 60);
        let now = Utc::now();

        limiter.block("alice", now + Duration::days(3650)).await;
        assert!(!limiter.try_acquire("alice", now).await.is_allow());
        assert_eq!(limiter.active_blocks(now).await.len(), 1);

        assert!(limiter.unblock("alice").await);
        assert!(limiter.try_acquire("alice", now).await.is_allow());
        assert!(!limiter.unblock("nobody").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_no_race_overshoot() {
        let limiter = Arc::new(limiter(300, 50, 60));
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire("alice", now).await.is_allow()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert!(allowed <= 50, "allowed {} > N", allowed);
        assert_eq!(allowed, 50);
    }
}
