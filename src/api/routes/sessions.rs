//! Session API endpoints.
//!
//! Provides HTTP endpoints for:
//! - Listing sessions (GET /sessions)
//! - Getting a specific session (GET /sessions/:id)
//! - Manually triggering a standup (POST /trigger)

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use super::super::error::{ApiError, ApiResult};
use crate::db::{Database, SessionRepository};
use crate::session::{MeetingSession, SessionStore, StoreError};

/// Commands forwarded from API handlers to the service loop.
#[derive(Debug)]
pub enum ApiCommand {
    TriggerStandup,
}

/// Shared state for session routes.
#[derive(Clone)]
pub struct SessionsState {
    pub tx: mpsc::Sender<ApiCommand>,
    pub store: SessionStore,
    pub db: Database,
}

pub fn router(state: SessionsState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/trigger", post(trigger_standup))
        .with_state(state)
}

fn session_summary(session: &MeetingSession) -> Value {
    json!({
        "meeting_id": session.meeting_id,
        "meet_url": session.meet_url,
        "start_time": session.start_time,
        "end_time": session.end_time,
        "status": session.status,
        "delivery_status": session.delivery_status,
        "delivery_attempts": session.delivery_attempts,
    })
}

async fn list_sessions(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<SessionsState>,
) -> ApiResult<Json<Value>> {
    let limit: usize = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let db = state.db.clone();
    let sessions = tokio::task::spawn_blocking(move || {
        let conn = db.connect()?;
        SessionRepository::list(&conn, limit)
    })
    .await
    .map_err(|_| ApiError::internal("Session query task failed"))??;

    let entries: Vec<Value> = sessions.iter().map(session_summary).collect();
    Ok(Json(json!({ "sessions": entries })))
}

async fn get_session(
    Path(id): Path<Uuid>,
    State(state): State<SessionsState>,
) -> ApiResult<Json<Value>> {
    // Live sessions come from the store; the database covers everything older.
    let session = match state.store.get(id).await {
        Some(session) => Some(session),
        None => {
            let db = state.db.clone();
            tokio::task::spawn_blocking(move || {
                let conn = db.connect()?;
                SessionRepository::get(&conn, id)
            })
            .await
            .map_err(|_| ApiError::internal("Session query task failed"))??
        }
    };

    match session {
        Some(s) => Ok(Json(json!({
            "meeting_id": s.meeting_id,
            "meet_url": s.meet_url,
            "meet_external_id": s.meet_external_id,
            "start_time": s.start_time,
            "end_time": s.end_time,
            "status": s.status,
            "transcript": s.transcript,
            "delivery_status": s.delivery_status,
            "delivery_attempts": s.delivery_attempts,
            "last_error": s.last_error,
        }))),
        None => Err(StoreError::NotFound(id).into()),
    }
}

async fn trigger_standup(State(state): State<SessionsState>) -> ApiResult<Json<Value>> {
    info!("Manual standup trigger received via API");

    match state.tx.send(ApiCommand::TriggerStandup).await {
        Ok(_) => Ok(Json(json!({
            "success": true,
            "message": "Standup trigger queued",
        }))),
        Err(e) => {
            error!("Failed to queue standup trigger: {}", e);
            Err(ApiError::internal("Service loop is not running"))
        }
    }
}
