//! Error taxonomy for the screenshot pipeline.
//!
//! Every pipeline outcome is a variant here so callers must handle each one;
//! the `IntoResponse` impl is the single place errors become HTTP responses.
//! Bodies carry one human-readable `error` string and nothing else; internal
//! detail goes to the logs.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    /// The input was not an absolute HTTP(S) URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The caller exhausted its point budget for the current window.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The rate-limit store could not be reached. Policy is fail-closed:
    /// the request is denied rather than letting throttling be bypassed.
    #[error("rate limiter unavailable")]
    LimiterUnavailable,

    /// The cache store failed. Soft failure: reads degrade to a miss and
    /// writes are logged and swallowed, so this rarely reaches a caller.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The render did not finish within the configured timeout.
    #[error("render timed out after {0:?}")]
    RenderTimeout(Duration),

    /// Navigation or capture failed inside the browser.
    #[error("render failed: {0}")]
    RenderFailed(String),

    /// No browser instance could be leased (pool shutting down or exhausted).
    #[error("browser instance unavailable")]
    BrowserUnavailable,

    /// Chrome could not be launched at all.
    #[error("browser launch failed: {0}")]
    BrowserLaunchFailed(String),
}

impl ScreenshotError {
    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::LimiterUnavailable | Self::BrowserUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::CacheUnavailable(_)
            | Self::RenderTimeout(_)
            | Self::RenderFailed(_)
            | Self::BrowserLaunchFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-facing message. Deliberately terse; never includes browser or
    /// store internals.
    fn public_message(&self) -> String {
        match self {
            Self::InvalidUrl(_) => "Invalid or missing URL".to_string(),
            Self::RateLimited { retry_after } => format!(
                "Too many requests, retry after {}s",
                retry_after.as_secs().max(1)
            ),
            Self::LimiterUnavailable => "Rate limiter unavailable".to_string(),
            Self::BrowserUnavailable => "Service is at capacity".to_string(),
            Self::CacheUnavailable(_)
            | Self::RenderTimeout(_)
            | Self::RenderFailed(_)
            | Self::BrowserLaunchFailed(_) => "Failed to generate screenshot".to_string(),
        }
    }
}

impl IntoResponse for ScreenshotError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = Json(json!({ "error": self.public_message() }));

        match self {
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1).to_string();
                (status, [(header::RETRY_AFTER, secs)], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
