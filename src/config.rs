//! Service configuration loaded from the environment with CLI overrides.
//!
//! Covers the full pipeline: HTTP bind address, browser pool sizing, render
//! timeout, cache TTL and the per-caller rate-limit window/budget.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the screenshot service.
///
/// # Examples
///
/// ```rust
/// use screenshot_service::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     browser_pool_size: 5,
///     render_timeout: std::time::Duration::from_secs(10),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Address the HTTP server binds to (default: "0.0.0.0:3000").
    pub bind_addr: String,

    /// Number of Chrome browser instances maintained in the pool (default: 4).
    ///
    /// Higher values increase render concurrency but consume more memory.
    pub browser_pool_size: usize,

    /// Hard timeout for a single render attempt (default: 30 seconds).
    ///
    /// A page that has not produced a screenshot within this window fails
    /// with `RenderTimeout` and the wedged Chrome instance is restarted.
    pub render_timeout: Duration,

    /// Time-to-live for cached screenshots (default: 3600 seconds).
    ///
    /// Entries older than this are dropped lazily on the next lookup.
    pub cache_ttl: Duration,

    /// Rate-limit window per caller (default: 60 seconds).
    pub rate_limit_window: Duration,

    /// Point budget per caller within one window (default: 10).
    ///
    /// Every request consumes one point; the (budget+1)-th request within a
    /// window is rejected with a retry-after hint.
    pub rate_limit_points: u32,

    /// Browser viewport used for every capture.
    pub viewport: Viewport,

    /// Path to the Chrome/Chromium executable (default: auto-detect).
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for page loads (default: Chrome default).
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            browser_pool_size: 4,
            render_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(3600),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_points: 10,
            viewport: Viewport::default(),
            chrome_path: None,
            user_agent: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional and fall back to the defaults above:
    ///
    /// - `SCREENSHOT_BIND_ADDR`: HTTP bind address
    /// - `SCREENSHOT_POOL_SIZE`: browser pool size
    /// - `SCREENSHOT_RENDER_TIMEOUT_SECS`: render timeout in seconds
    /// - `SCREENSHOT_CACHE_TTL_SECS`: cache TTL in seconds
    /// - `SCREENSHOT_RATE_WINDOW_SECS`: rate-limit window in seconds
    /// - `SCREENSHOT_RATE_POINTS`: rate-limit point budget per window
    /// - `CHROME_PATH`: Chrome executable location
    /// - `SCREENSHOT_USER_AGENT`: User-Agent override
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_addr = std::env::var("SCREENSHOT_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let browser_pool_size =
            env_parse("SCREENSHOT_POOL_SIZE")?.unwrap_or(defaults.browser_pool_size);

        let render_timeout = env_parse("SCREENSHOT_RENDER_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.render_timeout);

        let cache_ttl = env_parse("SCREENSHOT_CACHE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);

        let rate_limit_window = env_parse("SCREENSHOT_RATE_WINDOW_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.rate_limit_window);

        let rate_limit_points =
            env_parse("SCREENSHOT_RATE_POINTS")?.unwrap_or(defaults.rate_limit_points);

        let chrome_path = std::env::var("CHROME_PATH").ok();
        let user_agent = std::env::var("SCREENSHOT_USER_AGENT").ok();

        Ok(Self {
            bind_addr,
            browser_pool_size,
            render_timeout,
            cache_ttl,
            rate_limit_window,
            rate_limit_points,
            viewport: Viewport::default(),
            chrome_path,
            user_agent,
        })
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.browser_pool_size == 0 {
            anyhow::bail!("browser pool size must be greater than 0");
        }
        if self.render_timeout.is_zero() {
            anyhow::bail!("render timeout must be greater than 0");
        }
        if self.rate_limit_window.is_zero() {
            anyhow::bail!("rate limit window must be greater than 0");
        }
        if self.rate_limit_points == 0 {
            anyhow::bail!("rate limit budget must be greater than 0");
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            anyhow::bail!("viewport dimensions must be greater than 0");
        }
        Ok(())
    }
}

/// Browser viewport used when rendering pages for capture.
///
/// Every screenshot is taken at this fixed size; callers cannot override it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280).
    pub width: u32,

    /// Viewport height in pixels (default: 720).
    pub height: u32,

    /// Device pixel ratio (default: 1.0).
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            device_scale_factor: 1.0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        Err(_) => Ok(None),
    }
}

/// Chrome command-line arguments for headless capture.
///
/// Each pool instance gets unique temp/user-data directories and a unique
/// debugging port so concurrent instances never trip Chrome's singleton
/// checks.
pub fn chrome_args(config: &Config, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/screenshot-service-{unique_id}"),
        format!("--remote-debugging-port={}", 9222 + instance_id),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

/// Build the chromiumoxide launch configuration for one pool instance.
pub fn browser_config(
    config: &Config,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, crate::ScreenshotError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(chrome_args(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(crate::ScreenshotError::BrowserLaunchFailed)
}
