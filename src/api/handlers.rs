use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::{EventKind, SubscriptionFilter};
use crate::engine::StepEdit;
use crate::engine::types::{
    SessionFilter, SessionStatus, SessionSummary, StepResult, WorkflowSession,
};
use crate::storage::SnapshotDiff;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub goal: String,
}

#[derive(Serialize)]
pub struct SessionAck {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    pub status: Option<String>,
    pub goal: Option<String>,
}

#[derive(Serialize)]
pub struct SessionDetail {
    pub session: WorkflowSession,
    pub results: BTreeMap<String, StepResult>,
}

#[derive(Deserialize)]
pub struct ResumeQuery {
    pub version: Option<String>,
}

#[derive(Deserialize)]
pub struct ModifyRequest {
    pub edits: Vec<StepEdit>,
}

#[derive(Serialize)]
pub struct ModifyResponse {
    pub session_id: String,
    pub applied: Vec<String>,
}

#[derive(Serialize)]
pub struct VersionsResponse {
    pub session_id: String,
    pub versions: Vec<String>,
}

#[derive(Deserialize)]
pub struct DiffQuery {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub session_id: Option<String>,
    /// Comma-separated event types.
    pub types: Option<String>,
    /// Replay this many recent events first.
    pub history: Option<usize>,
}

#[derive(Serialize)]
pub struct AgentInfo {
    pub agent_kind: String,
    pub description: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionAck>), AppError> {
    if req.goal.trim().is_empty() {
        return Err(AppError::BadRequest("'goal' must not be empty".to_string()));
    }
    let session_id = state.orchestrator.execute(&req.goal).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SessionAck {
            session_id,
            status: SessionStatus::Running,
        }),
    ))
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<SessionStatus>()
                .map_err(|_| AppError::BadRequest(format!("Invalid status filter: {}", s)))
        })
        .transpose()?;
    let filter = SessionFilter {
        status,
        goal_contains: query.goal,
    };
    Ok(Json(state.orchestrator.list_sessions(&filter).await?))
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, AppError> {
    let session = state.orchestrator.get_session(&id).await?;
    let results = state.orchestrator.step_results(&id).await?;
    Ok(Json(SessionDetail { session, results }))
}

async fn ack(state: &AppState, id: String) -> Result<Json<SessionAck>, AppError> {
    let session = state.orchestrator.get_session(&id).await?;
    Ok(Json(SessionAck {
        session_id: id,
        status: session.status,
    }))
}

/// POST /sessions/{id}/pause
pub async fn pause_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionAck>, AppError> {
    state.orchestrator.pause(&id).await?;
    ack(&state, id).await
}

/// POST /sessions/{id}/resume
pub async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ResumeQuery>,
) -> Result<Json<SessionAck>, AppError> {
    state
        .orchestrator
        .resume_from(&id, query.version.as_deref())
        .await?;
    ack(&state, id).await
}

/// POST /sessions/{id}/interrupt
///
/// Returns once cancellation is requested; the session reports
/// `interrupted` after its active steps acknowledge.
pub async fn interrupt_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SessionAck>), AppError> {
    state.orchestrator.interrupt(&id).await?;
    let ack = ack(&state, id).await?;
    Ok((StatusCode::ACCEPTED, ack))
}

/// POST /sessions/{id}/abandon
pub async fn abandon_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionAck>, AppError> {
    state.orchestrator.abandon(&id).await?;
    ack(&state, id).await
}

/// POST /sessions/{id}/modify
pub async fn modify_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ModifyRequest>,
) -> Result<Json<ModifyResponse>, AppError> {
    if req.edits.is_empty() {
        return Err(AppError::BadRequest("'edits' must not be empty".to_string()));
    }
    let applied = state.orchestrator.modify(&id, req.edits).await?;
    Ok(Json(ModifyResponse {
        session_id: id,
        applied,
    }))
}

/// GET /sessions/{id}/versions
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VersionsResponse>, AppError> {
    let versions = state.orchestrator.versions(&id).await?;
    Ok(Json(VersionsResponse {
        session_id: id,
        versions,
    }))
}

/// GET /sessions/{id}/diff?from=&to=
pub async fn diff_versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<SnapshotDiff>, AppError> {
    Ok(Json(
        state
            .orchestrator
            .diff(&id, &query.from, &query.to)
            .await?,
    ))
}

/// GET /events (Server-Sent Events)
pub async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let mut filter = match query.session_id {
        Some(ref id) => SubscriptionFilter::session(id),
        None => SubscriptionFilter::all(),
    };
    if let Some(ref types) = query.types {
        let kinds = types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<EventKind>().map_err(AppError::BadRequest))
            .collect::<Result<Vec<_>, _>>()?;
        filter = filter.with_kinds(kinds);
    }

    let bus = state.orchestrator.bus();
    let subscription = match query.history {
        Some(n) if n > 0 => bus.subscribe_with_history(filter, n),
        _ => bus.subscribe(filter),
    };

    let stream = stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        let sse = match Event::default().event(event.kind.as_str()).json_data(&event) {
            Ok(sse) => sse,
            Err(e) => {
                warn!(error = %e, "Failed to encode event for SSE");
                Event::default().event("error").data(e.to_string())
            }
        };
        Some((Ok(sse), sub))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /agents
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<Vec<AgentInfo>> {
    let agents = state
        .orchestrator
        .context()
        .agents
        .list()
        .into_iter()
        .map(|(kind, desc)| AgentInfo {
            agent_kind: kind.to_string(),
            description: desc.to_string(),
        })
        .collect();
    Json(agents)
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
