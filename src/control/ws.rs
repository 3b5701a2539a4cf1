//! Control WebSocket
//!
//! Pushes the status snapshot on every state change and at least every
//! three seconds as a keepalive. Incoming `{action: …}` frames behave like
//! the matching HTTP POST.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{build_status, start_worker, stop_worker};
use crate::scaler::routing::RoutingMode;
use crate::scaler::Scaler;

/// Keepalive push period
const KEEPALIVE: Duration = Duration::from_secs(3);

pub async fn ws_handler(State(scaler): State<Arc<Scaler>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(scaler, socket))
}

#[derive(Debug, Deserialize)]
struct ActionFrame {
    action: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

async fn run_ws(scaler: Arc<Scaler>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut changes = scaler.subscribe_changes();
    let mut engine_events = scaler.engine.subscribe();
    let mut keepalive = tokio::time::interval(KEEPALIVE);

    if push_status(&scaler, &mut ws_tx).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if push_status(&scaler, &mut ws_tx).await.is_err() {
                    break;
                }
            }

            changed = changes.recv() => {
                if changed.is_err() {
                    // Lagged or closed; a fresh push is right either way
                    debug!("change channel lagged");
                }
                if push_status(&scaler, &mut ws_tx).await.is_err() {
                    break;
                }
            }

            event = engine_events.recv() => {
                if event.is_err() {
                    debug!("engine event channel lagged");
                }
                if push_status(&scaler, &mut ws_tx).await.is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        apply_action(&scaler, text.as_str());
                        if push_status(&scaler, &mut ws_tx).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("control websocket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn push_status(
    scaler: &Scaler,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let snapshot = build_status(scaler);
    let text = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
    ws_tx.send(Message::Text(text.into())).await
}

/// Apply one client action frame; equivalent to the matching HTTP POST
fn apply_action(scaler: &Arc<Scaler>, text: &str) {
    let frame: ActionFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("unparseable control frame: {e}");
            return;
        }
    };

    match frame.action.as_str() {
        "pause" => scaler.pause(),
        "resume" => scaler.resume(),
        "start" => {
            if let Err(e) = start_worker(scaler, frame.target) {
                warn!("ws start action failed: {e}");
            }
        }
        "stop" => {
            if let Err(e) = stop_worker(scaler, frame.target) {
                warn!("ws stop action failed: {e}");
            }
        }
        "route" => match frame.mode.as_deref().map(str::parse::<RoutingMode>) {
            Some(Ok(mode)) => scaler.set_mode(mode),
            _ => warn!("ws route action missing or invalid mode"),
        },
        other => warn!("unknown control action '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScalerConfig;
    use crate::fleet::{Fleet, FleetConfig};
    use crate::lifecycle::LifecycleEngine;

    fn test_scaler() -> Arc<Scaler> {
        let config =
            ScalerConfig::from_str("workers:\n  local:\n    url: http://127.0.0.1:11434\n")
                .unwrap();
        let engine = Arc::new(LifecycleEngine::from_scaler_config(&config));
        let fleet = Arc::new(Fleet::new(FleetConfig::default()));
        Arc::new(Scaler::new(config, engine, fleet))
    }

    #[test]
    fn test_apply_action_pause_and_route() {
        let scaler = test_scaler();

        apply_action(&scaler, r#"{"action":"pause"}"#);
        assert!(scaler.is_paused());

        apply_action(&scaler, r#"{"action":"resume"}"#);
        assert!(!scaler.is_paused());

        apply_action(&scaler, r#"{"action":"route","mode":"local"}"#);
        assert_eq!(scaler.mode(), RoutingMode::Local);
    }

    #[test]
    fn test_apply_action_ignores_garbage() {
        let scaler = test_scaler();
        apply_action(&scaler, "not json");
        apply_action(&scaler, r#"{"action":"warp"}"#);
        assert!(!scaler.is_paused());
    }
}
