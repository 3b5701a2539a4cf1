//! Agent-facing control plane API
//!
//! REST endpoints for registration and heartbeat plus the persistent
//! WebSocket stream carrying [`AgentMessage`] / [`ControlMessage`] frames.
//! One listener, separate from the proxy front door, so agent traffic never
//! mixes with inference traffic.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::{Fleet, StreamHandle, SUPERSEDED_CLOSE_REASON};
use crate::proto::{AgentMessage, HeartbeatRequest, RegisterRequest};

/// Create the agent control plane router
pub fn create_fleet_router(fleet: Arc<Fleet>) -> Router {
    Router::new()
        .route("/v1/register", post(register))
        .route("/v1/heartbeat", post(heartbeat))
        .route("/v1/connect", get(connect))
        .route("/v1/fleet", get(fleet_status))
        .route("/health", get(|| async { StatusCode::OK }))
        .layer(TraceLayer::new_for_http())
        .with_state(fleet)
}

async fn register(
    State(fleet): State<Arc<Fleet>>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    Json(fleet.register(&req))
}

async fn heartbeat(
    State(fleet): State<Arc<Fleet>>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match fleet.heartbeat(&req.node_id) {
        Ok(resp) => (StatusCode::OK, Json(serde_json::json!(resp))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string(), "code": "node_not_found"})),
        ),
    }
}

async fn fleet_status(State(fleet): State<Arc<Fleet>>) -> impl IntoResponse {
    Json(fleet.fleet_status())
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    node_id: String,
}

async fn connect(
    State(fleet): State<Arc<Fleet>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let node_id = params.node_id;
    ws.on_upgrade(move |socket| handle_stream(fleet, node_id, socket))
}

/// Run one agent stream to completion.
///
/// The send side drains the node's command queue FIFO; the receive side
/// dispatches agent messages into the fleet. When a newer stream opens for
/// the same node this one is closed with the "superseded" reason and must
/// not clear the session that replaced it.
async fn handle_stream(fleet: Arc<Fleet>, node_id: String, socket: WebSocket) {
    let handle: StreamHandle = match fleet.open_stream(&node_id) {
        Ok(h) => h,
        Err(e) => {
            warn!(%node_id, "rejecting stream: {e}");
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: "not registered".into(),
                })))
                .await;
            return;
        }
    };

    info!(%node_id, epoch = handle.epoch, "agent stream opened");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut superseded = false;

    loop {
        tokio::select! {
            _ = handle.superseded.cancelled() => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: SUPERSEDED_CLOSE_REASON.into(),
                    })))
                    .await;
                superseded = true;
                break;
            }

            msg = handle.queue.pop() => {
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(%node_id, "failed to encode control message: {e}");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_message(&fleet, &node_id, text.as_str());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%node_id, "stream receive error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // A superseded session no longer owns the node entry; close_stream
    // checks the epoch so this is safe either way.
    if !superseded {
        fleet.close_stream(&node_id, handle.epoch);
    }
    info!(%node_id, epoch = handle.epoch, superseded, "agent stream ended");
}

fn handle_agent_message(fleet: &Fleet, node_id: &str, text: &str) {
    let msg: AgentMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(node_id, "unparseable agent message: {e}");
            return;
        }
    };

    match msg {
        AgentMessage::Status(status) => {
            if let Err(e) = fleet.update_status(node_id, status) {
                warn!(node_id, "status update failed: {e}");
            }
        }
        AgentMessage::CommandResult(result) => {
            debug!(node_id, command_id = %result.command_id, success = result.success,
                "command result received");
            fleet.complete_result(result);
        }
        AgentMessage::Log(entry) => match entry.level.as_str() {
            "error" => tracing::error!(node_id, "[agent] {}", entry.message),
            "warn" => tracing::warn!(node_id, "[agent] {}", entry.message),
            _ => tracing::info!(node_id, "[agent] {}", entry.message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::FleetConfig;
    use crate::proto::{NodeCapabilities, NodeType, RegisterResponse};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> (Arc<Fleet>, Router) {
        let fleet = Arc::new(Fleet::new(FleetConfig::default()));
        let app = create_fleet_router(fleet.clone());
        (fleet, app)
    }

    fn register_body(id: &str) -> String {
        serde_json::to_string(&RegisterRequest {
            node_id: id.to_string(),
            node_type: NodeType::GpuWorker,
            instance_id: None,
            mesh_ip: None,
            public_ip: None,
            private_ip: None,
            region: None,
            zone: None,
            capabilities: NodeCapabilities::default(),
            labels: Default::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_endpoint() {
        let (fleet, app) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/register")
                    .header("content-type", "application/json")
                    .body(Body::from(register_body("gpu-1")))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let resp: RegisterResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(resp.accepted);
        assert!(fleet.get_node("gpu-1").is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node_is_404() {
        let (_fleet, app) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/heartbeat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"node_id":"ghost"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fleet_status_lists_nodes() {
        let (fleet, app) = test_app();
        fleet.register(&serde_json::from_str(&register_body("gpu-1")).unwrap());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/fleet")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: crate::proto::FleetStatusResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status.nodes_total, 1);
        assert_eq!(status.nodes_connected, 0);
        assert_eq!(status.nodes[0].node_id, "gpu-1");
    }
}
