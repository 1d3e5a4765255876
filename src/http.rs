//! HTTP surface for the screenshot pipeline.
//!
//! ## Routes
//!
//! - `POST /screenshot` renders (or serves from cache) a URL, returning a
//!   base64 PNG data URL
//! - `GET /health` reports browser pool and pipeline statistics (JSON)
//!
//! Any other method on a known route gets `405 {"error": "Method not
//! allowed"}`. Every response carries a restrictive content-security-policy
//! permitting only same-origin plus `data:`/`https:` image sources.

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::{PoolHealth, RenderRequest, ScreenshotError, ScreenshotService};

/// Shared handler state; everything is `Arc`ed and cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScreenshotService>,
    pub pool: Arc<dyn PoolHealth>,
}

const CSP: &str = "default-src 'self'; img-src data: https:;";

/// Build the complete service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/screenshot", post(take_screenshot))
        .route("/health", get(health))
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CSP),
        ))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct ScreenshotBody {
    /// Optional so that a missing field maps to the 400 contract instead of
    /// an axum rejection.
    url: Option<String>,
}

/// `POST /screenshot`, the single pipeline endpoint.
///
/// Caller identity for throttling is the peer IP; there is no
/// authentication.
async fn take_screenshot(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ScreenshotBody>,
) -> Result<Response, ScreenshotError> {
    let url = body
        .url
        .ok_or_else(|| ScreenshotError::InvalidUrl("missing url field".to_string()))?;

    let request = RenderRequest::new(url, addr.ip().to_string());
    let screenshot = state.service.handle(&request).await?;

    let image = format!("data:image/png;base64,{}", BASE64.encode(&screenshot.data));
    let cache_status = if screenshot.cache_hit { "hit" } else { "miss" };

    Ok((
        [("x-cache", cache_status)],
        Json(json!({ "image": image })),
    )
        .into_response())
}

/// `GET /health`, pool statistics for operators and probes.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.pool.stats().await;

    Json(json!({
        "status": "ok",
        "browser_pool": stats,
        "in_flight_renders": state.service.in_flight_renders(),
    }))
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not allowed" })),
    )
        .into_response()
}
