//! Execution pipeline
//!
//! Orchestrates one command request through the mediation layers:
//! rate limiter, command validator, breakout monitor, container state
//! gate, runtime dispatch. Exactly one audit event is appended per
//! request, and the append is fail-closed: a command that cannot be
//! audited is reported as failed even when it executed.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use rangeguard_core::{CommandRequest, RangeGuardConfig, RangeGuardError};
use rangeguard_security::{
    AlertSink, AuditEvent, AuditLog, AuditOutcome, BreakoutMonitor, CommandValidator,
    DenyCode, ExecutionContext, RateLimiter, SecurityAlert, SecurityError, ThreatLevel,
    ValidationVerdict,
};

use crate::lifecycle::{ContainerLifecycle, LifecycleError};

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecOutcome {
    /// Passed all layers and ran to completion
    AllowedExecuted,
    /// Denied by a mediation layer; no container contacted
    Blocked,
    /// Container already had a command in flight
    Busy,
    /// Runtime-level failure: timeout, unreachable container
    Error,
}

impl ExecOutcome {
    fn audit_outcome(self) -> AuditOutcome {
        match self {
            ExecOutcome::AllowedExecuted => AuditOutcome::AllowedExecuted,
            ExecOutcome::Blocked => AuditOutcome::Blocked,
            ExecOutcome::Busy | ExecOutcome::Error => AuditOutcome::Error,
        }
    }
}

/// Verdict plus captured execution output, returned to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineResult {
    pub verdict: ValidationVerdict,
    pub outcome: ExecOutcome,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<u64>,
    /// Stable error code for Busy/Error outcomes
    pub error_code: Option<String>,
}

impl PipelineResult {
    fn blocked(verdict: ValidationVerdict) -> Self {
        Self {
            verdict,
            outcome: ExecOutcome::Blocked,
            stdout: None,
            stderr: None,
            exit_code: None,
            duration_ms: None,
            error_code: None,
        }
    }

    fn failed(outcome: ExecOutcome, code: &str) -> Self {
        Self {
            verdict: ValidationVerdict::allow(),
            outcome,
            stdout: None,
            stderr: None,
            exit_code: None,
            duration_ms: None,
            error_code: Some(code.to_string()),
        }
    }
}

pub struct ExecutionPipeline {
    validator: CommandValidator,
    breakout: BreakoutMonitor,
    rate_limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    lifecycle: Arc<ContainerLifecycle>,
    alerts: Arc<dyn AlertSink>,
}

impl ExecutionPipeline {
    pub fn new(
        config: &RangeGuardConfig,
        rate_limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
        lifecycle: Arc<ContainerLifecycle>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self, SecurityError> {
        Ok(Self {
            validator: CommandValidator::new(&config.validator)?,
            breakout: BreakoutMonitor::new(&config.breakout)?,
            rate_limiter,
            audit,
            lifecycle,
            alerts,
        })
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        self.audit.clone()
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    pub fn lifecycle(&self) -> Arc<ContainerLifecycle> {
        self.lifecycle.clone()
    }

    /// Run one request through the full mediation sequence. Denials and
    /// runtime failures come back as a [`PipelineResult`]; only an audit
    /// append failure surfaces as `Err` (fail closed).
    pub async fn execute(
        &self,
        request: CommandRequest,
    ) -> Result<PipelineResult, RangeGuardError> {
        let now = Utc::now();

        // 1. atomic rate-limit reservation; a denied request is still a
        //    consumed request
        let rate_verdict = self.rate_limiter.try_acquire(&request.user_id, now).await;
        if !rate_verdict.is_allow() {
            return self.finish(&request, PipelineResult::blocked(rate_verdict)).await;
        }

        // 2. whitelist + deny patterns
        let validation = self.validator.validate(&request.command).await;

        // 3. breakout monitor runs unconditionally; a CRITICAL hit
        //    outranks the validator verdict and triggers incident
        //    response before the caller hears back
        let ctx = ExecutionContext {
            user_id: request.user_id.clone(),
            container_id: request.container_id.clone(),
        };
        let breakout = self.breakout.inspect(&request.command, &ctx).await;
        if !breakout.is_allow() {
            self.respond_to_breakout(&request, &breakout).await;
            return self.finish(&request, PipelineResult::blocked(breakout)).await;
        }
        if !validation.is_allow() {
            return self.finish(&request, PipelineResult::blocked(validation)).await;
        }

        // 4. container state gate + per-container execution slot
        let grant = match self.lifecycle.begin_exec(&request.container_id).await {
            Ok(grant) => grant,
            Err(LifecycleError::Quarantined(id)) => {
                let verdict = ValidationVerdict::deny(
                    rangeguard_security::DecidingLayer::Lifecycle,
                    DenyCode::ContainerQuarantined,
                    ThreatLevel::High,
                    format!("container '{}' is quarantined", id),
                );
                return self.finish(&request, PipelineResult::blocked(verdict)).await;
            }
            Err(LifecycleError::Busy(_)) => {
                return self
                    .finish(&request, PipelineResult::failed(ExecOutcome::Busy, "CONTAINER_BUSY"))
                    .await;
            }
            Err(e) => {
                let core: RangeGuardError = e.into();
                let result = PipelineResult::failed(ExecOutcome::Error, core.code());
                return self.finish(&request, result).await;
            }
        };

        // 5. dispatch with cancellation on timeout
        let runtime = self.lifecycle.runtime();
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(
            request.timeout(),
            runtime.exec(&grant.runtime_handle, &request.command),
        )
        .await
        {
            Ok(Ok(output)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.lifecycle.touch(&request.container_id).await;
                debug!(
                    user = %request.user_id,
                    container = %request.container_id,
                    exit_code = output.exit_code,
                    duration_ms,
                    "command executed"
                );
                PipelineResult {
                    verdict: ValidationVerdict::allow(),
                    outcome: ExecOutcome::AllowedExecuted,
                    stdout: Some(output.stdout),
                    stderr: Some(output.stderr),
                    exit_code: Some(output.exit_code),
                    duration_ms: Some(duration_ms),
                    error_code: None,
                }
            }
            Ok(Err(e)) => {
                warn!(container = %request.container_id, error = %e, "runtime exec failed");
                let mut result =
                    PipelineResult::failed(ExecOutcome::Error, "RUNTIME_UNAVAILABLE");
                result.duration_ms = Some(started.elapsed().as_millis() as u64);
                result
            }
            Err(_elapsed) => {
                warn!(
                    container = %request.container_id,
                    timeout_secs = request.timeout_secs,
                    "execution timed out, reclaiming"
                );
                if let Err(e) = runtime.interrupt(&grant.runtime_handle).await {
                    warn!(container = %request.container_id, error = %e, "interrupt after timeout failed");
                }
                let mut result = PipelineResult::failed(ExecOutcome::Error, "EXECUTION_TIMEOUT");
                result.duration_ms = Some(started.elapsed().as_millis() as u64);
                result
            }
        };
        drop(grant);

        self.finish(&request, result).await
    }

    /// Incident response for a CRITICAL breakout verdict: quarantine the
    /// container, block the user, raise the alert. All synchronous, so
    /// the next request from this user or container is denied
    /// deterministically.
    async fn respond_to_breakout(&self, request: &CommandRequest, verdict: &ValidationVerdict) {
        error!(
            user = %request.user_id,
            container = %request.container_id,
            reason = %verdict.reason,
            "breakout detected, quarantining"
        );

        match self
            .lifecycle
            .quarantine(&request.container_id, &verdict.reason)
            .await
        {
            Ok(()) => {}
            Err(LifecycleError::NotFound(_)) | Err(LifecycleError::Terminated(_)) => {}
            Err(e) => error!(container = %request.container_id, error = %e, "quarantine failed"),
        }

        self.rate_limiter
            .block(&request.user_id, Utc::now() + Duration::days(36500))
            .await;

        let signature = self
            .breakout
            .matched_signature(&request.command)
            .await
            .map(|s| s.id)
            .unwrap_or_else(|| "unknown".to_string());
        self.alerts
            .critical(&SecurityAlert {
                user_id: request.user_id.clone(),
                container_id: request.container_id.clone(),
                signature,
                command: request.command.clone(),
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Append the single terminal audit event and hand the result back.
    async fn finish(
        &self,
        request: &CommandRequest,
        result: PipelineResult,
    ) -> Result<PipelineResult, RangeGuardError> {
        let verdict_code = match result.error_code.as_deref() {
            Some(code) if result.outcome != ExecOutcome::AllowedExecuted => code.to_string(),
            _ => result.verdict.code_str().to_string(),
        };

        let mut event = AuditEvent::new(
            &request.user_id,
            result.outcome.audit_outcome(),
            &verdict_code,
        )
        .with_container(&request.container_id)
        .with_command(&request.command)
        .with_threat(result.verdict.threat_level);
        if let Some(duration_ms) = result.duration_ms {
            event = event.with_duration(duration_ms);
        }
        if result.outcome == ExecOutcome::Blocked {
            event = event.with_detail(&result.verdict.reason);
        }

        // the error names what actually happened so operators can
        // reconcile an executed-but-unrecorded command
        self.audit.append(event).await.map_err(|e| {
            RangeGuardError::AuditUnavailable(format!(
                "{}; unrecorded outcome: {:?}",
                e, result.outcome
            ))
        })?;

        if result.outcome == ExecOutcome::Blocked {
            info!(
                user = %request.user_id,
                verdict = %verdict_code,
                "command blocked"
            );
        }
        Ok(result)
    }
}
