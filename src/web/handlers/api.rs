use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info};

use crate::cache::CacheStats;
use crate::pipeline::{AnswerRequest, AnswerResponse, PipelineEvent, StageEvent};
use crate::session::{ChatMessage, ConversationSession};
use crate::web::state::AppState;

// Cache types

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct InvalidateRequest {
    /// Substring of cached SQL or table name; everything when absent.
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

// Session types

#[derive(Debug, Serialize)]
pub struct SessionOverview {
    pub active: Option<ConversationSession>,
    pub sessions: Vec<ConversationSession>,
}

#[derive(Debug, Deserialize)]
pub struct SessionListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub ended: bool,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub cache_enabled: bool,
    pub cache_entries: usize,
    pub cache: CacheStats,
    pub active_sessions: usize,
    pub recent_stages: Vec<StageEvent>,
}

fn check_request(request: &AnswerRequest) -> Result<(), (StatusCode, String)> {
    if request.user_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "user_id is required".to_string()));
    }
    if request.question.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "question is required".to_string()));
    }
    Ok(())
}

// API Implementations

pub async fn ask(
    state: State<Arc<AppState>>,
    Json(payload): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, (StatusCode, String)> {
    check_request(&payload)?;
    info!("Question from {}: {}", payload.user_id, payload.question);
    Ok(Json(state.pipeline.answer(payload).await))
}

fn to_sse(event: PipelineEvent) -> Event {
    let name = match &event {
        PipelineEvent::Stage(_) => "stage",
        PipelineEvent::Delta { .. } => "delta",
        PipelineEvent::Complete(_) => "complete",
    };
    match serde_json::to_string(&event) {
        Ok(data) => Event::default().event(name).data(data),
        Err(e) => {
            error!("Failed to serialize {} event: {}", name, e);
            Event::default().event("error").data(r#"{"error": "event serialization failed"}"#)
        }
    }
}

pub async fn ask_stream(
    state: State<Arc<AppState>>,
    Json(payload): Json<AnswerRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    check_request(&payload)?;
    info!("Streaming question from {}: {}", payload.user_id, payload.question);
    let events = state
        .pipeline
        .answer_stream(payload)
        .map(|event| Ok::<_, Infallible>(to_sse(event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// An empty body clears everything
pub async fn invalidate_cache(
    state: State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<InvalidateResponse>, (StatusCode, String)> {
    let request: InvalidateRequest = if body.is_empty() {
        InvalidateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e)))?
    };
    let removed = state
        .pipeline
        .cache()
        .invalidate(request.pattern.as_deref())
        .await;
    info!("Cache invalidation removed {} entries", removed);
    Ok(Json(InvalidateResponse { removed }))
}

pub async fn get_sessions(
    state: State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<SessionListParams>,
) -> Result<Json<SessionOverview>, (StatusCode, String)> {
    let sessions = state.pipeline.sessions();
    let active = sessions.get_active_session(&user_id).await;
    let recent = sessions
        .sessions(&user_id, params.limit.unwrap_or(20).min(200))
        .await
        .map_err(|e| {
            error!("Failed to list sessions for {}: {}", user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to list sessions".to_string())
        })?;
    Ok(Json(SessionOverview {
        active,
        sessions: recent,
    }))
}

pub async fn start_session(
    state: State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<(StatusCode, Json<ConversationSession>), (StatusCode, String)> {
    let session = state
        .pipeline
        .sessions()
        .start_new_session(&user_id)
        .await
        .map_err(|e| {
            error!("Failed to start session for {}: {}", user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to start session".to_string())
        })?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn end_session(
    state: State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<EndSessionResponse> {
    let ended = state.pipeline.sessions().end_session(&user_id).await;
    Json(EndSessionResponse { ended })
}

pub async fn get_history(
    state: State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ChatMessage>>, (StatusCode, String)> {
    let history = state
        .pipeline
        .sessions()
        .history(&user_id, params.session_id.as_deref())
        .await
        .map_err(|e| {
            error!("Failed to load history for {}: {}", user_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load history".to_string())
        })?;
    Ok(Json(history))
}

pub async fn system_status(state: State<Arc<AppState>>) -> Json<SystemStatus> {
    let cache = state.pipeline.cache();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (chrono::Utc::now() - state.startup_time).num_seconds(),
        cache_enabled: cache.is_enabled(),
        cache_entries: cache.len().await,
        cache: cache.stats(),
        active_sessions: state.pipeline.sessions().active_count().await,
        recent_stages: state.stage_log.snapshot(),
    })
}
