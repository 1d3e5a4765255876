//! Bounded pool of headless Chrome instances.
//!
//! Renders lease an instance for the duration of one capture and return it
//! via RAII, so instances are released on every exit path including panics
//! and cancelled futures. The semaphore caps concurrent leases at the pool
//! size; callers past capacity queue on it (their wait is bounded by the
//! render timeout one layer up). Crashed or wedged instances are relaunched
//! rather than handed out.

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{browser_config, Config, ScreenshotError};

/// One Chrome instance owned by the pool.
struct PooledInstance {
    id: usize,
    browser: Arc<Mutex<Browser>>,
    /// Task draining the CDP event stream; finished means Chrome died.
    handler: tokio::task::JoinHandle<()>,
    launched_at: Instant,
}

impl PooledInstance {
    async fn teardown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// Exclusive lease on one pool instance.
///
/// Dropping the lease returns the instance to the idle queue and only then
/// releases the capacity permit, so an acquirer can never pop an empty
/// queue.
pub struct BrowserLease {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: Arc<BrowserPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserLease")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        self.pool
            .idle
            .lock()
            .expect("idle queue poisoned")
            .push_back(self.instance_id);
    }
}

/// Holds an id popped from the idle queue during `acquire`. Until the lease
/// is armed, dropping the guard returns the id, so no exit path can leak a
/// pool slot.
struct IdleSlot<'a> {
    pool: &'a BrowserPool,
    id: Option<usize>,
}

impl IdleSlot<'_> {
    /// The lease now owns the slot; the guard must not return it.
    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for IdleSlot<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.pool
                .idle
                .lock()
                .expect("idle queue poisoned")
                .push_back(id);
        }
    }
}

pub struct BrowserPool {
    instances: Mutex<Vec<PooledInstance>>,
    idle: std::sync::Mutex<VecDeque<usize>>,
    permits: Arc<Semaphore>,
    config: Config,
    shutting_down: AtomicBool,
    total_captures: AtomicUsize,
    restarts: AtomicUsize,
}

impl BrowserPool {
    /// Launch `config.browser_pool_size` Chrome instances and start the
    /// background maintenance task.
    pub async fn new(config: Config) -> Result<Arc<Self>, ScreenshotError> {
        let pool = Arc::new(Self {
            instances: Mutex::new(Vec::new()),
            idle: std::sync::Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(config.browser_pool_size)),
            config,
            shutting_down: AtomicBool::new(false),
            total_captures: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        });

        {
            let mut instances = pool.instances.lock().await;
            for id in 0..pool.config.browser_pool_size {
                // Stagger launches; simultaneous first-runs race on profile
                // setup.
                if id > 0 {
                    sleep(Duration::from_millis(250)).await;
                }
                let instance = pool.launch_instance(id).await?;
                instances.push(instance);
                pool.idle.lock().expect("idle queue poisoned").push_back(id);
                info!(instance_id = id, "browser instance launched");
            }
            info!(count = instances.len(), "browser pool ready");
        }

        pool.clone().spawn_maintenance();
        Ok(pool)
    }

    async fn launch_instance(&self, id: usize) -> Result<PooledInstance, ScreenshotError> {
        let launch_config = browser_config(&self.config, id)?;

        let (browser, mut handler) = Browser::launch(launch_config)
            .await
            .map_err(|e| ScreenshotError::BrowserLaunchFailed(e.to_string()))?;

        // The CDP handler is a stream that must be polled for the browser
        // connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!(instance_id = id, error = %e, "browser handler error");
                    break;
                }
            }
        });

        Ok(PooledInstance {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
            launched_at: Instant::now(),
        })
    }

    /// Lease an instance, waiting for capacity if the pool is fully busy.
    pub async fn acquire(self: &Arc<Self>) -> Result<BrowserLease, ScreenshotError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(ScreenshotError::BrowserUnavailable);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScreenshotError::BrowserUnavailable)?;

        let instance_id = self
            .idle
            .lock()
            .expect("idle queue poisoned")
            .pop_front()
            .ok_or(ScreenshotError::BrowserUnavailable)?;

        // The id is out of the queue but no lease exists yet. The slot guard
        // puts it back if anything below errors or this future is dropped
        // mid-await; otherwise the queue would stay one entry short forever.
        let slot = IdleSlot {
            pool: self,
            id: Some(instance_id),
        };

        let browser = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .get_mut(instance_id)
                .ok_or(ScreenshotError::BrowserUnavailable)?;

            if instance.handler.is_finished() {
                warn!(instance_id, "leasing a dead instance, relaunching first");
                self.replace_instance(instance).await?;
            }

            instance.browser.clone()
        };

        self.total_captures.fetch_add(1, Ordering::Relaxed);
        slot.disarm();

        Ok(BrowserLease {
            browser,
            instance_id,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Tear down an instance's Chrome process and launch a fresh one in its
    /// slot. Used when a render times out, since a hung navigation would
    /// otherwise keep the process alive indefinitely.
    pub async fn restart_instance(&self, instance_id: usize) -> Result<(), ScreenshotError> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(instance_id)
            .ok_or(ScreenshotError::BrowserUnavailable)?;

        self.replace_instance(instance).await
    }

    async fn replace_instance(&self, instance: &mut PooledInstance) -> Result<(), ScreenshotError> {
        let id = instance.id;

        let _ = instance.browser.lock().await.close().await;
        instance.handler.abort();

        match self.launch_instance(id).await {
            Ok(fresh) => {
                *instance = fresh;
                self.restarts.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("screenshot_browser_restarts_total");
                info!(instance_id = id, "browser instance relaunched");
                Ok(())
            }
            Err(e) => {
                error!(instance_id = id, error = %e, "browser relaunch failed");
                Err(e)
            }
        }
    }

    fn spawn_maintenance(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if self.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                self.restart_dead_instances().await;
            }
        });
    }

    /// Relaunch instances whose CDP handler has exited. Only instances
    /// currently idle are touched; a leased instance is repaired on its
    /// next acquire instead.
    async fn restart_dead_instances(&self) {
        let idle: Vec<usize> = self
            .idle
            .lock()
            .expect("idle queue poisoned")
            .iter()
            .copied()
            .collect();

        let mut instances = self.instances.lock().await;
        for id in idle {
            if let Some(instance) = instances.get_mut(id) {
                if instance.handler.is_finished() {
                    warn!(
                        instance_id = id,
                        age_secs = instance.launched_at.elapsed().as_secs(),
                        "idle instance died, relaunching"
                    );
                    if let Err(e) = self.replace_instance(instance).await {
                        error!(instance_id = id, error = %e, "maintenance relaunch failed");
                    }
                }
            }
        }
    }

    /// Stop handing out leases, wait briefly for in-flight captures, then
    /// tear everything down.
    pub async fn shutdown(&self) {
        info!("shutting down browser pool");
        self.shutting_down.store(true, Ordering::Relaxed);

        for _ in 0..20 {
            let idle_count = self.idle.lock().expect("idle queue poisoned").len();
            if idle_count == self.config.browser_pool_size {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let mut instances = self.instances.lock().await;
        for instance in instances.drain(..) {
            instance.teardown().await;
        }
        info!("browser pool shutdown complete");
    }

    pub async fn stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let idle = self.idle.lock().expect("idle queue poisoned").len();

        BrowserPoolStats {
            total_instances: instances.len(),
            idle_instances: idle,
            leased_instances: instances.len().saturating_sub(idle),
            total_captures: self.total_captures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BrowserPoolStats {
    pub total_instances: usize,
    pub idle_instances: usize,
    pub leased_instances: usize,
    pub total_captures: usize,
    pub restarts: usize,
}

/// Read-only health view of the pool, seamed out so the HTTP layer can be
/// exercised without launching Chrome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PoolHealth: Send + Sync {
    async fn stats(&self) -> BrowserPoolStats;
}

#[async_trait]
impl PoolHealth for BrowserPool {
    async fn stats(&self) -> BrowserPoolStats {
        BrowserPool::stats(self).await
    }
}
