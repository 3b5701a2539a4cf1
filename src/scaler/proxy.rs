//! Streaming reverse proxy
//!
//! The front door: every non-reserved path is forwarded verbatim to the
//! selected backend with streaming bodies in both directions. Requests that
//! arrive with no ready backend block on a coalesced cold start up to the
//! configured deadline.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::routing::{select_backend, RouteDecision, Selection};
use super::Scaler;
use crate::lifecycle::LifecycleError;

/// Suggested client back-off for 503 responses, seconds
const RETRY_AFTER_SECS: u32 = 30;

/// Build the proxy-facing router: health probes at the root, control
/// endpoints under the reserved prefix, everything else proxied.
pub fn create_proxy_router(scaler: Arc<Scaler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest(crate::config::CONTROL_PREFIX, crate::control::create_control_router())
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(scaler)
}

/// Liveness: the scaler process is up
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness: initialized with at least one known worker (ready or not)
async fn ready(State(scaler): State<Arc<Scaler>>) -> impl IntoResponse {
    if scaler.engine.worker_names().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no workers configured")
    } else {
        (StatusCode::OK, "OK")
    }
}

/// The request admission pipeline and the proxy itself
async fn proxy_handler(State(scaler): State<Arc<Scaler>>, req: Request) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let decision = match acquire_target(&scaler).await {
        Ok(decision) => decision,
        Err(response) => return response,
    };

    // Admission: advance the idle clock and counters, then proxy
    scaler.admit_request(&decision.worker);

    let response = forward(&scaler, req, &decision).await;
    let status = response.status();
    info!(
        %method,
        path = %path,
        target = %decision.worker,
        url = %decision.url,
        status = status.as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "proxied request"
    );
    response
}

/// Select a backend, blocking on a cold start when permitted.
///
/// Re-validates readiness after the wait: the probe may have gone stale
/// while this request was blocked.
async fn acquire_target(scaler: &Arc<Scaler>) -> Result<RouteDecision, Response> {
    let mode = scaler.mode();

    match select_backend(&scaler.engine, mode) {
        Selection::Ready(decision) => Ok(decision),
        Selection::Unavailable { reason } => Err(service_unavailable(&reason)),
        Selection::ColdStart { worker } => {
            if scaler.is_paused() {
                return Err(service_unavailable(
                    "scaler is paused and no backend is ready",
                ));
            }

            scaler.record_blocked_on_cold_start();
            debug!(worker = %worker, "request blocked on cold start");

            let deadline = scaler.config.cold_start_deadline();
            match scaler.engine.ensure_running(&worker, deadline).await {
                Ok(()) => match select_backend(&scaler.engine, mode) {
                    Selection::Ready(decision) => Ok(decision),
                    _ => Err(service_unavailable("backend not ready after cold start")),
                },
                Err(LifecycleError::ColdStartTimeout { .. }) => Err(service_unavailable(
                    "cold start did not finish within the deadline",
                )),
                Err(e) => {
                    warn!(worker = %worker, "cold start failed: {e}");
                    Err(service_unavailable(&format!("cold start failed: {e}")))
                }
            }
        }
    }
}

/// Forward one request to the upstream with streaming bodies.
/// A connect failure before any bytes were written maps to 502.
async fn forward(scaler: &Scaler, req: Request, decision: &RouteDecision) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let upstream_url = format!("{}{}", decision.url, path_and_query);

    let (parts, body) = req.into_parts();
    let headers = proxy_headers(&parts.headers);

    let upstream_request = scaler
        .http
        .request(parts.method, &upstream_url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream_response = match upstream_request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %upstream_url, "upstream unreachable: {e}");
            return (
                StatusCode::BAD_GATEWAY,
                format!("upstream unreachable: {e}"),
            )
                .into_response();
        }
    };

    let status = upstream_response.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if !is_hop_by_hop(name) {
            response_headers.insert(name.clone(), value.clone());
        }
    }

    // Stream the body through without buffering; a mid-stream upstream
    // error terminates the client stream, no retry.
    let stream = upstream_response
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other));
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Copy request headers for the upstream, dropping hop-by-hop headers and
/// `Host` (the HTTP client sets it from the upstream URL)
fn proxy_headers(original: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in original {
        if name == header::HOST || is_hop_by_hop(name) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// 503 with a Retry-After hint, the standard answer whenever no backend
/// can be readied for this request
pub fn service_unavailable(reason: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())],
        format!("no backend available: {reason}\n"),
    )
        .into_response()
}
