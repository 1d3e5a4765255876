//! Single-URL render: lease a browser, load the page, capture a PNG.
//!
//! The render timeout is fatal to the attempt and hard-cancels the browser
//! work: the leased Chrome instance is replaced, not merely abandoned, so a
//! hung navigation cannot leak a process. Retries are deliberately not done
//! here; whether to retry is the caller's decision.

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{BrowserLease, BrowserPool, Config, ScreenshotError};

/// The expensive stage of the pipeline, behind a trait so the orchestrator
/// can be exercised without Chrome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Load `url` and capture a viewport PNG.
    async fn render(&self, url: &str) -> Result<Vec<u8>, ScreenshotError>;
}

/// Renderer backed by the Chrome pool.
pub struct BrowserRenderer {
    pool: Arc<BrowserPool>,
    config: Config,
}

impl BrowserRenderer {
    pub fn new(pool: Arc<BrowserPool>, config: Config) -> Self {
        Self { pool, config }
    }

    async fn capture(&self, lease: &BrowserLease, url: &str) -> Result<Vec<u8>, ScreenshotError> {
        let page = {
            let browser = lease.browser.lock().await;
            browser
                .new_page(url)
                .await
                .map_err(|e| ScreenshotError::RenderFailed(e.to_string()))?
        };

        let result = self.capture_page(&page).await;

        // Close on success and on capture failure alike. The timeout path
        // never reaches this point; it replaces the whole instance instead.
        let _ = page.close().await;

        result
    }

    async fn capture_page(&self, page: &Page) -> Result<Vec<u8>, ScreenshotError> {
        let viewport = &self.config.viewport;
        let metrics_override = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(ScreenshotError::RenderFailed)?;

        page.execute(metrics_override)
            .await
            .map_err(|e| ScreenshotError::RenderFailed(e.to_string()))?;

        // Wait for network activity to settle before capturing.
        page.wait_for_navigation()
            .await
            .map_err(|e| ScreenshotError::RenderFailed(e.to_string()))?;

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();

        page.screenshot(params)
            .await
            .map_err(|e| ScreenshotError::RenderFailed(e.to_string()))
    }
}

#[async_trait]
impl Renderer for BrowserRenderer {
    async fn render(&self, url: &str) -> Result<Vec<u8>, ScreenshotError> {
        let started = Instant::now();

        // Backpressure policy: wait at most one render-timeout for pool
        // capacity, then fail fast instead of queueing unboundedly.
        let lease = timeout(self.config.render_timeout, self.pool.acquire())
            .await
            .map_err(|_| ScreenshotError::BrowserUnavailable)??;

        let result = capture_within(
            self.config.render_timeout,
            self.capture(&lease, url),
            async {
                warn!(url, timeout = ?self.config.render_timeout, "render timed out, replacing instance");
                // The navigation may be wedged inside Chrome; replace the
                // process so it cannot linger past this request.
                if let Err(e) = self.pool.restart_instance(lease.instance_id).await {
                    warn!(instance_id = lease.instance_id, error = %e, "post-timeout restart failed");
                }
            },
        )
        .await;

        if result.is_ok() {
            metrics::histogram!(
                "screenshot_render_duration_seconds",
                started.elapsed().as_secs_f64()
            );
        }
        debug!(url, elapsed = ?started.elapsed(), ok = result.is_ok(), "render finished");

        result
    }
}

/// Race a capture against its budget. The capture future is dropped on
/// expiry, hard-cancelling the in-flight CDP calls, and the recovery future
/// runs before `RenderTimeout` is returned. Errors the capture produces
/// within the budget pass through untouched.
async fn capture_within<C, R>(
    budget: Duration,
    capture: C,
    on_timeout: R,
) -> Result<Vec<u8>, ScreenshotError>
where
    C: Future<Output = Result<Vec<u8>, ScreenshotError>>,
    R: Future<Output = ()>,
{
    match timeout(budget, capture).await {
        Ok(result) => result,
        Err(_) => {
            metrics::increment_counter!("screenshot_render_timeouts_total");
            on_timeout.await;
            Err(ScreenshotError::RenderTimeout(budget))
        }
    }
}
