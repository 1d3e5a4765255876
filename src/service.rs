//! Screenshot orchestrator: validate, throttle, cache, render.
//!
//! `ScreenshotService` owns no state of its own beyond the in-flight render
//! registry; everything else lives in the injected collaborators, so the
//! service is safe for concurrent use and trivially shareable behind an
//! `Arc`.
//!
//! Pipeline per request:
//!
//! 1. validate the URL (no downstream work on invalid input)
//! 2. consume one rate-limit point (fail-closed on limiter outage)
//! 3. cache lookup (read errors degrade to a miss)
//! 4. on miss, render; concurrent requests for the same key share one
//!    render through the in-flight registry
//! 5. cache the result (write errors logged and swallowed), respond

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    cache_key, validate_url, Config, RateLimiter, Renderer, ScreenshotCache, ScreenshotError,
};

/// One incoming screenshot request.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Correlation id for logs.
    pub id: String,
    /// Raw caller-supplied URL; validated before any other work.
    pub url: String,
    /// Opaque throttling token, typically the peer IP.
    pub caller_id: String,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            caller_id: caller_id.into(),
        }
    }
}

/// Successful pipeline outcome.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// PNG bytes.
    pub data: Vec<u8>,
    /// Whether the image came from the cache rather than a fresh render.
    pub cache_hit: bool,
    /// Wall time spent in the pipeline.
    pub elapsed: Duration,
}

type RenderOutcome = Result<Vec<u8>, ScreenshotError>;

pub struct ScreenshotService {
    limiter: Arc<dyn RateLimiter>,
    cache: Arc<dyn ScreenshotCache>,
    renderer: Arc<dyn Renderer>,
    cache_ttl: Duration,
    /// Per-key registry of renders currently in progress. The first request
    /// for a key becomes the leader; concurrent requests subscribe and
    /// receive the leader's outcome instead of rendering again.
    in_flight: DashMap<String, broadcast::Sender<RenderOutcome>>,
}

impl ScreenshotService {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        cache: Arc<dyn ScreenshotCache>,
        renderer: Arc<dyn Renderer>,
        config: &Config,
    ) -> Self {
        Self {
            limiter,
            cache,
            renderer,
            cache_ttl: config.cache_ttl,
            in_flight: DashMap::new(),
        }
    }

    /// Run the full pipeline for one request.
    pub async fn handle(&self, request: &RenderRequest) -> Result<Screenshot, ScreenshotError> {
        let started = Instant::now();
        metrics::increment_counter!("screenshot_requests_total");

        validate_url(&request.url)?;

        self.limiter.consume(&request.caller_id).await?;

        // Raw URL as key: no normalization, documented limitation.
        let key = cache_key(&request.url);

        match self.cache.get(&key).await {
            Ok(Some(data)) => {
                debug!(request_id = %request.id, url = %request.url, "cache hit");
                return Ok(Screenshot {
                    data,
                    cache_hit: true,
                    elapsed: started.elapsed(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                // The cache is an optimization; a broken store must not
                // fail the request.
                warn!(request_id = %request.id, error = %e, "cache read failed, treating as miss");
            }
        }

        let data = self.render_coalesced(&key, &request.url).await?;

        info!(
            request_id = %request.id,
            url = %request.url,
            bytes = data.len(),
            elapsed = ?started.elapsed(),
            "screenshot rendered"
        );

        Ok(Screenshot {
            data,
            cache_hit: false,
            elapsed: started.elapsed(),
        })
    }

    /// Render with at-most-one concurrent render per key.
    async fn render_coalesced(&self, key: &str, url: &str) -> RenderOutcome {
        enum Role {
            Leader(broadcast::Sender<RenderOutcome>),
            Waiter(broadcast::Receiver<RenderOutcome>),
        }

        // The entry guard makes subscribe-or-insert atomic: a request either
        // sees an existing sender and subscribes, or installs its own.
        let role = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => Role::Waiter(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Leader(tx) => {
                // Unregisters on every exit path, including cancellation,
                // so an abandoned render cannot strand later requests.
                let unregister = InFlightGuard {
                    registry: &self.in_flight,
                    key,
                };

                let result = self.renderer.render(url).await;

                if let Ok(image) = &result {
                    if let Err(e) = self.cache.put(key, image.clone(), self.cache_ttl).await {
                        // The response already succeeded; a failed write
                        // must not fail the request.
                        warn!(key, error = %e, "cache write failed");
                    }
                }

                // Remove the registry entry before broadcasting: once the
                // result is out no new waiter may subscribe to this sender.
                drop(unregister);
                let _ = tx.send(result.clone());
                result
            }
            Role::Waiter(mut rx) => {
                metrics::increment_counter!("screenshot_renders_coalesced_total");
                debug!(key, "joining in-flight render");
                match rx.recv().await {
                    Ok(outcome) => outcome,
                    // Sender dropped without a result: the leader was
                    // cancelled before finishing.
                    Err(_) => Err(ScreenshotError::RenderFailed(
                        "in-flight render was abandoned".to_string(),
                    )),
                }
            }
        }
    }

    /// Number of renders currently in progress. Exposed for the health
    /// endpoint.
    pub fn in_flight_renders(&self) -> usize {
        self.in_flight.len()
    }
}

struct InFlightGuard<'a> {
    registry: &'a DashMap<String, broadcast::Sender<RenderOutcome>>,
    key: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.key);
    }
}
