use clap::Parser;
use screenshot_service::{
    router, AppState, BrowserPool, BrowserRenderer, Config, MemoryCache, MemoryRateLimiter,
    ScreenshotService,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// On-demand web screenshot rendering service.
#[derive(Parser, Debug)]
#[command(name = "screenshot-service")]
#[command(about = "Render, cache and throttle web page screenshots", version)]
struct Args {
    /// HTTP bind address
    #[arg(long)]
    bind: Option<String>,

    /// Browser pool size
    #[arg(long)]
    pool_size: Option<usize>,

    /// Render timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Cache TTL in seconds
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Chrome executable path
    #[arg(long)]
    chrome_path: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;

    info!("starting screenshot-service v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    // Explicit construction of every pipeline collaborator; the orchestrator
    // holds no process-wide state.
    let pool = BrowserPool::new(config.clone()).await?;
    let limiter = Arc::new(MemoryRateLimiter::new(
        config.rate_limit_window,
        config.rate_limit_points,
    ));
    limiter.spawn_sweeper();
    let cache = Arc::new(MemoryCache::new());
    let renderer = Arc::new(BrowserRenderer::new(pool.clone(), config.clone()));
    let service = Arc::new(ScreenshotService::new(limiter, cache, renderer, &config));

    let app = router(AppState {
        service,
        pool: pool.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    info!("shutting down");
    pool.shutdown().await;

    if let Err(e) = result {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("screenshot-service stopped");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;

    // CLI arguments override the environment.
    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(pool_size) = args.pool_size {
        config.browser_pool_size = pool_size;
    }
    if let Some(timeout) = args.timeout {
        config.render_timeout = Duration::from_secs(timeout);
    }
    if let Some(cache_ttl) = args.cache_ttl {
        config.cache_ttl = Duration::from_secs(cache_ttl);
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!(
        bind = %config.bind_addr,
        pool_size = config.browser_pool_size,
        render_timeout = ?config.render_timeout,
        cache_ttl = ?config.cache_ttl,
        rate_window = ?config.rate_limit_window,
        rate_points = config.rate_limit_points,
        "configuration loaded"
    );

    Ok(config)
}

fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .with_target(false)
        .init();

    Ok(())
}

async fn shutdown_signal() {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to install SIGINT handler");
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
