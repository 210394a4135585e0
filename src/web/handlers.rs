//! HTTP request handlers.

use super::error::{AppError, AppResult};
use super::AppState;
use crate::db::{ConnectionState, DowntimeEvent, Heartbeat, NewHeartbeat, Telemetry};
use crate::monitor::LinkState;
use crate::notify::deliver_recovered;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

// ============================================================================
// Heartbeat ingest
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub connection_state: ConnectionState,
    /// RFC 3339 "as of" time reported by the appliance
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_downtime_id: Option<i64>,
}

pub async fn handle_post_heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let heartbeat = NewHeartbeat {
        timestamp: req.timestamp,
        connection_state: req.connection_state,
        telemetry: req.telemetry,
        metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
    };

    let outcome = state.supervisor.record_heartbeat(&heartbeat, Utc::now())?;

    // Fire and forget: the response does not wait on delivery
    if let Some(event) = &outcome.closed {
        if let Some(ended_at) = event.ended_at {
            let notifier = state.notifier.clone();
            let (id, started_at) = (event.id, event.started_at);
            tokio::spawn(async move {
                deliver_recovered(notifier.as_ref(), id, started_at, ended_at).await;
            });
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(HeartbeatResponse {
            id: outcome.heartbeat_id,
            closed_downtime_id: outcome.closed.map(|e| e.id),
        }),
    ))
}

// ============================================================================
// Read API
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: LinkState,
    pub last_heartbeat: Option<Heartbeat>,
    pub active_downtime: Option<DowntimeEvent>,
    pub heartbeat_timeout_ms: u64,
    pub supervisor_running: bool,
    pub checked_at: DateTime<Utc>,
}

pub async fn handle_status(State(state): State<AppState>) -> AppResult<Json<StatusResponse>> {
    let link_state = state.supervisor.link_state()?;
    let last_heartbeat = state.store.last_heartbeat()?;
    let active_downtime = state.store.active_downtime()?;

    Ok(Json(StatusResponse {
        state: link_state,
        last_heartbeat,
        active_downtime,
        heartbeat_timeout_ms: state.supervisor.settings().heartbeat_timeout.as_millis() as u64,
        supervisor_running: state.supervisor.is_running(),
        checked_at: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

impl ListQuery {
    fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

pub async fn handle_get_heartbeats(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Heartbeat>>> {
    Ok(Json(state.store.recent_heartbeats(query.limit())?))
}

pub async fn handle_get_downtimes(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<DowntimeEvent>>> {
    Ok(Json(state.store.recent_downtimes(query.limit())?))
}

pub async fn handle_health() -> &'static str {
    "ok"
}
