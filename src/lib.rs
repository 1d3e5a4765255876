//! # Screenshot Service
//!
//! An on-demand web screenshot rendering service. Given a URL it renders
//! the page in a pooled headless Chrome instance, returns the capture as a
//! base64 PNG data URL, caches the result, and throttles abusive callers.
//!
//! ## Pipeline
//!
//! ```text
//! caller → validate → rate-limit → cache lookup → [miss] render → cache store → caller
//! ```
//!
//! - Rendering is bounded by a browser pool and a hard per-render timeout;
//!   a timed-out Chrome instance is replaced, never leaked.
//! - Concurrent requests for the same URL coalesce into a single render.
//! - The rate limiter is fail-closed: if its store is unavailable the
//!   request is denied rather than letting throttling be bypassed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use screenshot_service::{
//!     BrowserPool, BrowserRenderer, Config, MemoryCache, MemoryRateLimiter,
//!     RenderRequest, ScreenshotService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!
//!     let pool = BrowserPool::new(config.clone()).await?;
//!     let service = ScreenshotService::new(
//!         Arc::new(MemoryRateLimiter::new(config.rate_limit_window, config.rate_limit_points)),
//!         Arc::new(MemoryCache::new()),
//!         Arc::new(BrowserRenderer::new(pool.clone(), config.clone())),
//!         &config,
//!     );
//!
//!     let request = RenderRequest::new("https://example.com", "127.0.0.1");
//!     let screenshot = service.handle(&request).await?;
//!     println!("captured {} bytes", screenshot.data.len());
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## HTTP surface
//!
//! `POST /screenshot` with `{"url": "<string>"}` returns
//! `200 {"image": "data:image/png;base64,..."}`, or `400` for invalid
//! input, `429` (+ `Retry-After`) when throttled, `500` on render failure
//! and `503` when the limiter store or browser pool is unavailable.

/// Configuration and Chrome launch arguments
pub mod config;

/// Error taxonomy and HTTP mapping
pub mod error;

/// URL validation, the first pipeline stage
pub mod validate;

/// Per-caller request throttling
pub mod rate_limit;

/// Screenshot cache with lazy TTL expiration
pub mod cache;

/// Bounded pool of headless Chrome instances
pub mod browser_pool;

/// Single-URL page render and capture
pub mod renderer;

/// Pipeline orchestration and request coalescing
pub mod service;

/// axum router and handlers
pub mod http;

#[cfg(test)]
mod tests;

pub use browser_pool::*;
pub use cache::*;
pub use config::*;
pub use error::*;
pub use http::*;
pub use rate_limit::*;
pub use renderer::*;
pub use service::*;
pub use validate::*;
