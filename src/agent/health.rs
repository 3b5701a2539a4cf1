//! Agent liveness endpoints
//!
//! A tiny local HTTP server: `/health` answers 200 while either the fleet
//! stream or the broker publisher is connected, `/ready` only while the
//! primary stream is up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use tracing::info;

#[derive(Default)]
pub struct AgentHealth {
    stream_up: AtomicBool,
    broker_up: AtomicBool,
}

impl AgentHealth {
    pub fn set_stream_up(&self, up: bool) {
        self.stream_up.store(up, Ordering::SeqCst);
    }

    pub fn set_broker_up(&self, up: bool) {
        self.broker_up.store(up, Ordering::SeqCst);
    }

    pub fn stream_up(&self) -> bool {
        self.stream_up.load(Ordering::SeqCst)
    }

    pub fn broker_up(&self) -> bool {
        self.broker_up.load(Ordering::SeqCst)
    }
}

pub fn create_health_router(health: Arc<AgentHealth>) -> Router {
    Router::new()
        .route("/health", get(live))
        .route("/ready", get(ready))
        .with_state(health)
}

async fn live(State(health): State<Arc<AgentHealth>>) -> impl IntoResponse {
    if health.stream_up() || health.broker_up() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "disconnected")
    }
}

async fn ready(State(health): State<Arc<AgentHealth>>) -> impl IntoResponse {
    if health.stream_up() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stream down")
    }
}

/// Bind and serve the liveness endpoints in the background
pub async fn spawn_health_server(
    port: u16,
    health: Arc<AgentHealth>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "agent health endpoint listening");
    let app = create_health_router(health);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reflects_stream_and_broker() {
        let health = Arc::new(AgentHealth::default());
        let app = create_health_router(health.clone());

        // Nothing connected: both endpoints fail
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Broker alone satisfies /health but not /ready
        health.set_broker_up(true);
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Stream up: ready
        health.set_stream_up(true);
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
