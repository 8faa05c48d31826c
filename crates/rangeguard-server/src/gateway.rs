//! Gateway service

use axum::Router;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

use rangeguard_core::{RangeGuardConfig, RangeGuardError};
use rangeguard_sandbox::{ContainerLifecycle, ContainerRuntime, ExecutionPipeline};
use rangeguard_security::{AlertSink, AuditLog, LogAlertSink, RateLimiter, SecurityError};

use crate::api::{create_router, AppState};

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Gateway {
    config: RangeGuardConfig,
    state: AppState,
}

impl Gateway {
    pub fn new(
        config: RangeGuardConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, SecurityError> {
        let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
        Self::with_alerts(config, runtime, alerts)
    }

    pub fn with_alerts(
        config: RangeGuardConfig,
        runtime: Arc<dyn ContainerRuntime>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self, SecurityError> {
        let audit = Arc::new(AuditLog::new(&config.audit));
        let lifecycle = Arc::new(ContainerLifecycle::new(
            runtime.clone(),
            audit.clone(),
            config.lifecycle.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let pipeline = Arc::new(ExecutionPipeline::new(
            &config,
            rate_limiter.clone(),
            audit.clone(),
            lifecycle.clone(),
            alerts,
        )?);

        Ok(Self {
            config,
            state: AppState {
                pipeline,
                lifecycle,
                audit,
                rate_limiter,
                runtime,
            },
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the process is stopped. Also starts the
    /// periodic idle-container sweep.
    pub async fn start(&self) -> rangeguard_core::Result<()> {
        self.spawn_idle_sweeper();

        let app = self.router();
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| RangeGuardError::Config(format!("invalid listen address: {}", e)))?;

        info!("RangeGuard gateway starting on {}", addr);
        info!(
            rate_window_secs = self.config.rate_limit.window_secs,
            rate_max_requests = self.config.rate_limit.max_requests,
            idle_max_secs = self.config.lifecycle.idle_max_secs,
            "mediation layers configured"
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| RangeGuardError::Config(format!("failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app).await.map_err(RangeGuardError::Io)?;
        Ok(())
    }

    fn spawn_idle_sweeper(&self) {
        let lifecycle = self.state.lifecycle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let reclaimed = lifecycle.sweep_idle(Utc::now()).await;
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), "idle sweep terminated containers");
                }
            }
        });
    }
}
