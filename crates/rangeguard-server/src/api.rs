//! HTTP API routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use rangeguard_core::{CommandRequest, NetworkSegment, RangeGuardError, ResourceCeiling};
use rangeguard_sandbox::{
    ContainerLifecycle, ContainerRuntime, ContainerState, ExecOutcome, ExecutionPipeline,
    LifecycleError, PipelineResult,
};
use rangeguard_security::{
    AuditLog, AuditQuery, AuditStats, DenyCode, RateLimiter, SIGNATURE_SET_VERSION,
};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ExecutionPipeline>,
    pub lifecycle: Arc<ContainerLifecycle>,
    pub audit: Arc<AuditLog>,
    pub rate_limiter: Arc<RateLimiter>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

/// API-level failure: a reason code plus the HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "code": self.code,
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "VALIDATION_DENIED" | "NOT_WHITELISTED" | "DANGEROUS_PATTERN" | "BREAKOUT_DETECTED"
        | "CONTAINER_QUARANTINED" => StatusCode::FORBIDDEN,
        "RATE_LIMIT_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
        "CONTAINER_BUSY" => StatusCode::CONFLICT,
        "CONTAINER_NOT_FOUND" | "SNAPSHOT_NOT_FOUND" => StatusCode::NOT_FOUND,
        "EXECUTION_TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        "PROVISION_ERROR" | "RUNTIME_UNAVAILABLE" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RangeGuardError> for ApiError {
    fn from(err: RangeGuardError) -> Self {
        let code = err.code();
        Self::new(status_for(code), code, err.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        // a second provision against a live session is a conflict, not
        // a provisioning failure
        if matches!(err, LifecycleError::SessionActive(_)) {
            return Self::new(StatusCode::CONFLICT, "SESSION_ACTIVE", err.to_string());
        }
        let core: RangeGuardError = err.into();
        core.into()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/session/{session_id}/create", post(create_session))
        .route("/session/{session_id}", delete(delete_session))
        .route("/snapshot/{container_id}", post(create_snapshot))
        .route("/restore/{snapshot_id}", post(restore_snapshot))
        .route("/security/audit-log", get(audit_log))
        .route("/security/report", get(security_report))
        .route("/security/unblock/{user_id}", post(unblock_user))
        .route("/status", get(service_status))
        .route("/health", get(health_check))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub user_id: String,
    pub container_id: String,
    pub command: String,
    pub timeout_secs: Option<u64>,
}

/// Run one command through the mediation pipeline. The response body is
/// the full pipeline result; the status code reflects the outcome.
async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Response, ApiError> {
    let mut request = CommandRequest::new(&req.user_id, &req.container_id, &req.command);
    if let Some(timeout_secs) = req.timeout_secs {
        request = request.with_timeout(timeout_secs);
    }

    let result = state.pipeline.execute(request).await?;
    Ok((outcome_status(&result), Json(result)).into_response())
}

fn outcome_status(result: &PipelineResult) -> StatusCode {
    match result.outcome {
        ExecOutcome::AllowedExecuted => StatusCode::OK,
        ExecOutcome::Blocked => match result.verdict.code {
            Some(DenyCode::RateLimitExceeded) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::FORBIDDEN,
        },
        ExecOutcome::Busy => StatusCode::CONFLICT,
        ExecOutcome::Error => status_for(result.error_code.as_deref().unwrap_or("")),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: Option<String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<u64>,
    pub network_segment: Option<NetworkSegment>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub container_id: String,
}

async fn create_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let defaults = ResourceCeiling::default();
    let ceiling = ResourceCeiling {
        cpu_cores: req.cpu_limit.unwrap_or(defaults.cpu_cores),
        memory_bytes: req.memory_limit.unwrap_or(defaults.memory_bytes),
    };
    let segment = req.network_segment.unwrap_or(NetworkSegment::Isolated);
    let owner = req.user_id.unwrap_or_else(|| session_id.clone());

    let container = state
        .lifecycle
        .provision(&session_id, &owner, ceiling, segment)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            container_id: container.id,
        }),
    ))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let container = state
        .lifecycle
        .live_by_session(&session_id)
        .await
        .ok_or_else(|| {
            ApiError::not_found(
                "CONTAINER_NOT_FOUND",
                format!("no live container for session '{}'", session_id),
            )
        })?;
    state.lifecycle.terminate(&container.id).await?;
    Ok(Json(serde_json::json!({ "terminated": container.id })))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    pub name: Option<String>,
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    Query(params): Query<SnapshotParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = params.name.unwrap_or_else(|| "manual".to_string());
    let snapshot = state.lifecycle.snapshot(&container_id, &name).await?;
    Ok(Json(serde_json::json!({ "snapshot_id": snapshot.id })))
}

#[derive(Debug, Deserialize)]
pub struct RestoreParams {
    pub session: String,
    pub user_id: Option<String>,
    pub network_segment: Option<NetworkSegment>,
}

async fn restore_snapshot(
    State(state): State<AppState>,
    Path(snapshot_id): Path<String>,
    Query(params): Query<RestoreParams>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let owner = params.user_id.unwrap_or_else(|| params.session.clone());
    let segment = params.network_segment.unwrap_or(NetworkSegment::Isolated);
    let container = state
        .lifecycle
        .restore(
            &snapshot_id,
            &params.session,
            &owner,
            ResourceCeiling::default(),
            segment,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            container_id: container.id,
        }),
    ))
}

async fn audit_log(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Json<serde_json::Value> {
    let events = state.audit.query(&query).await;
    let last_seq = events.last().map(|e| e.seq);
    Json(serde_json::json!({
        "events": events,
        "last_seq": last_seq,
    }))
}

#[derive(Debug, Serialize)]
pub struct ContainerCensus {
    pub total: usize,
    pub provisioning: usize,
    pub running: usize,
    pub quarantined: usize,
    pub terminated: usize,
}

#[derive(Debug, Serialize)]
pub struct BlockedUser {
    pub user_id: String,
    pub until: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct SecurityReport {
    pub audit: AuditStats,
    pub active_blocks: Vec<BlockedUser>,
    pub containers: ContainerCensus,
    pub signature_set_version: u32,
}

async fn security_report(State(state): State<AppState>) -> Json<SecurityReport> {
    let audit = state.audit.stats().await;
    let active_blocks = state
        .rate_limiter
        .active_blocks(chrono::Utc::now())
        .await
        .into_iter()
        .map(|(user_id, until)| BlockedUser { user_id, until })
        .collect();

    let containers = state.lifecycle.list().await;
    let count = |s: ContainerState| containers.iter().filter(|c| c.state == s).count();
    let census = ContainerCensus {
        total: containers.len(),
        provisioning: count(ContainerState::Provisioning),
        running: count(ContainerState::Running),
        quarantined: count(ContainerState::Quarantined),
        terminated: count(ContainerState::Terminated),
    };

    Json(SecurityReport {
        audit,
        active_blocks,
        containers: census,
        signature_set_version: SIGNATURE_SET_VERSION,
    })
}

async fn unblock_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let cleared = state.rate_limiter.unblock(&user_id).await;
    Json(serde_json::json!({ "user_id": user_id, "cleared": cleared }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub runtime_reachable: bool,
    pub containers: usize,
    pub audit_events: usize,
}

async fn service_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let runtime_reachable = state.runtime.ping().await.is_ok();
    Json(StatusResponse {
        status: if runtime_reachable { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_reachable,
        containers: state.lifecycle.list().await.len(),
        audit_events: state.audit.len().await,
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
