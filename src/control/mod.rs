//! Control API
//!
//! Inspection and operator overrides under the reserved prefix: a JSON
//! status snapshot, start/stop/pause/resume/route actions, a WebSocket that
//! pushes the snapshot on every state change, and the dashboard page.
//! Control paths never touch the idle clock. Place an auth layer at the
//! prefix boundary; the core does not authenticate.

pub mod ui;
pub mod ws;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::WorkerSnapshot;
use crate::scaler::routing::RoutingMode;
use crate::scaler::Scaler;

pub fn create_control_router() -> Router<Arc<Scaler>> {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/route", post(route_mode))
        .route("/ws", get(ws::ws_handler))
        .route("/ui", get(ui::dashboard))
}

// ============================================================================
// Status snapshot
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub mode: RoutingMode,
    pub paused: bool,
    pub idle_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_until_shutdown_secs: Option<u64>,
    pub counters: Counters,
    pub workers: Vec<WorkerSnapshot>,
    pub fleet: FleetSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_connected: Option<bool>,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Counters {
    pub requests_total: u64,
    pub requests_blocked_cold_start: u64,
    pub cold_start_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub nodes_total: usize,
    pub nodes_connected: usize,
}

/// Assemble the full snapshot the status endpoint and the WebSocket push
pub fn build_status(scaler: &Scaler) -> StatusSnapshot {
    let fleet_status = scaler.fleet.fleet_status();

    // Broker connectivity as reported by agents; the scaler itself has no
    // broker connection.
    let reports: Vec<bool> = fleet_status
        .nodes
        .iter()
        .filter_map(|n| n.status.as_ref().and_then(|s| s.broker_connected))
        .collect();
    let broker_connected = if reports.is_empty() {
        None
    } else {
        Some(reports.iter().any(|connected| *connected))
    };

    StatusSnapshot {
        mode: scaler.mode(),
        paused: scaler.is_paused(),
        idle_seconds: scaler.idle_duration().as_secs(),
        time_until_shutdown_secs: scaler.time_until_shutdown(),
        counters: Counters {
            requests_total: scaler.requests_total(),
            requests_blocked_cold_start: scaler.requests_blocked_cold_start(),
            cold_start_count: scaler.cold_start_count(),
        },
        workers: scaler.engine.snapshots(),
        fleet: FleetSummary {
            nodes_total: fleet_status.nodes_total,
            nodes_connected: fleet_status.nodes_connected,
        },
        broker_connected,
        uptime_secs: scaler.uptime().as_secs(),
        timestamp: Utc::now(),
    }
}

async fn status(State(scaler): State<Arc<Scaler>>) -> impl IntoResponse {
    Json(build_status(&scaler))
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Serialize)]
struct ActionResponse {
    accepted: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    code: String,
}

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: error.into(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct TargetParams {
    target: Option<String>,
}

/// Issue a start intent; completion is observable via `status`.
/// The default target is the first on-demand worker (cloud, then mesh).
pub(crate) fn start_worker(scaler: &Arc<Scaler>, target: Option<String>) -> Result<String, String> {
    let worker = match target {
        Some(t) => t,
        None => scaler
            .engine
            .on_demand_names()
            .first()
            .map(|n| n.to_string())
            .ok_or_else(|| "no on-demand worker configured".to_string())?,
    };
    scaler.engine.handle(&worker).map_err(|e| e.to_string())?;

    let engine = scaler.engine.clone();
    let deadline = engine.config().start_timeout;
    let name = worker.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.ensure_running(&name, deadline).await {
            tracing::warn!(worker = %name, "manual start failed: {e}");
        }
    });
    Ok(worker)
}

pub(crate) fn stop_worker(scaler: &Arc<Scaler>, target: Option<String>) -> Result<String, String> {
    let worker = match target {
        Some(t) => t,
        None => scaler
            .engine
            .on_demand_names()
            .first()
            .map(|n| n.to_string())
            .ok_or_else(|| "no on-demand worker configured".to_string())?,
    };
    scaler.engine.handle(&worker).map_err(|e| e.to_string())?;

    let engine = scaler.engine.clone();
    let name = worker.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.stop(&name).await {
            tracing::warn!(worker = %name, "manual stop failed: {e}");
        }
    });
    Ok(worker)
}

async fn start(
    State(scaler): State<Arc<Scaler>>,
    Query(params): Query<TargetParams>,
) -> Response {
    match start_worker(&scaler, params.target) {
        Ok(worker) => Json(ActionResponse {
            accepted: true,
            message: format!("start issued for '{worker}'"),
        })
        .into_response(),
        Err(e) => api_error(StatusCode::BAD_REQUEST, "bad_target", e),
    }
}

async fn stop(
    State(scaler): State<Arc<Scaler>>,
    Query(params): Query<TargetParams>,
) -> Response {
    match stop_worker(&scaler, params.target) {
        Ok(worker) => Json(ActionResponse {
            accepted: true,
            message: format!("stop issued for '{worker}'"),
        })
        .into_response(),
        Err(e) => api_error(StatusCode::BAD_REQUEST, "bad_target", e),
    }
}

async fn pause(State(scaler): State<Arc<Scaler>>) -> impl IntoResponse {
    scaler.pause();
    Json(ActionResponse {
        accepted: true,
        message: "scaler paused".to_string(),
    })
}

async fn resume(State(scaler): State<Arc<Scaler>>) -> impl IntoResponse {
    scaler.resume();
    Json(ActionResponse {
        accepted: true,
        message: "scaler resumed".to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct ModeParams {
    mode: String,
}

async fn route_mode(
    State(scaler): State<Arc<Scaler>>,
    Query(params): Query<ModeParams>,
) -> Response {
    match params.mode.parse::<RoutingMode>() {
        Ok(mode) => {
            scaler.set_mode(mode);
            Json(serde_json::json!({"mode": mode.to_string()})).into_response()
        }
        Err(e) => api_error(StatusCode::BAD_REQUEST, "bad_mode", e),
    }
}
