//! Per-caller request throttling.
//!
//! A fixed window with a point budget: every request consumes one point, and
//! the (budget+1)-th request within a window is rejected with the time left
//! until the window resets. Caller identity is an opaque token (the HTTP
//! layer uses the peer IP); this is throttling, not authentication.
//!
//! The store is a trait seam so a shared backend can be plugged in later;
//! the in-process implementation shards buckets over a `DashMap`, whose
//! entry API serializes concurrent mutations of one caller's bucket and
//! gives the atomic increment-and-check the budget invariant needs.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ScreenshotError;

/// Counter store consulted once per request, before any cache or browser
/// work.
///
/// Implementations must guarantee that concurrent `consume` calls for the
/// same caller never let the total consumed exceed the budget. A store that
/// cannot be reached must return [`ScreenshotError::LimiterUnavailable`];
/// the pipeline treats that as a denial (fail-closed).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one point for `caller_id`, or reject with a retry-after hint.
    async fn consume(&self, caller_id: &str) -> Result<(), ScreenshotError>;
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
}

/// In-process fixed-window limiter.
pub struct MemoryRateLimiter {
    window: Duration,
    points: u32,
    buckets: DashMap<String, Bucket>,
}

impl MemoryRateLimiter {
    pub fn new(window: Duration, points: u32) -> Self {
        Self {
            window,
            points,
            buckets: DashMap::new(),
        }
    }

    /// Number of callers currently tracked. Exposed for the health endpoint.
    pub fn tracked_callers(&self) -> usize {
        self.buckets.len()
    }

    /// Drop every bucket whose window has fully elapsed. An evicted caller
    /// simply starts a fresh window on its next request, so eviction never
    /// grants extra points.
    pub fn sweep_expired(&self) {
        self.buckets
            .retain(|_, bucket| bucket.window_start.elapsed() < self.window);
    }

    /// Sweep stale buckets once per window. Caller ids are attacker-chosen
    /// (peer addresses), so without eviction the map grows without bound.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.window);
            loop {
                interval.tick().await;
                limiter.sweep_expired();
            }
        });
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn consume(&self, caller_id: &str) -> Result<(), ScreenshotError> {
        // The entry guard holds the shard lock for the whole
        // check-reset-increment sequence, so two requests for the same
        // caller cannot interleave.
        let mut entry = self
            .buckets
            .entry(caller_id.to_string())
            .or_insert_with(|| Bucket {
                count: 0,
                window_start: Instant::now(),
            });
        let bucket = entry.value_mut();

        let elapsed = bucket.window_start.elapsed();
        if elapsed >= self.window {
            bucket.count = 0;
            bucket.window_start = Instant::now();
        }

        if bucket.count >= self.points {
            let retry_after = self.window.saturating_sub(bucket.window_start.elapsed());
            metrics::increment_counter!("screenshot_rate_limited_total");
            return Err(ScreenshotError::RateLimited { retry_after });
        }

        bucket.count += 1;
        Ok(())
    }
}
