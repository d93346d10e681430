//! Controller run loop
//!
//! Waits for the workload cache to sync, then runs workers that pull the
//! sync key off the work queue and reconcile. A failed pass is handed to
//! the error observer and retried through the queue's rate limiter; it
//! never stops the loop.

use super::{ErrorObserver, LoggingErrorObserver, LoopState, Reconciler};
use crate::error::{ControllerError, ReconcileError};
use crate::health::{components, HealthRegistry};
use crate::models::SyncKey;
use crate::observability::{StructuredLogger, WatcherMetrics};
use crate::queue::WorkQueue;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the reconcile loop
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of workers pulling from the queue (default: 1)
    pub workers: usize,
    /// Maximum wait for the workload cache to sync (default: 5 minutes)
    pub cache_sync_timeout: Duration,
    /// Deadline for a single reconciliation pass (default: 30 seconds)
    pub sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            cache_sync_timeout: Duration::from_secs(5 * 60),
            sync_timeout: Duration::from_secs(30),
        }
    }
}

/// Reconcile loop driving a [`Reconciler`] from a [`WorkQueue`]
pub struct Controller {
    queue: WorkQueue<SyncKey>,
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    observer: Arc<dyn ErrorObserver>,
    health: HealthRegistry,
    metrics: Option<WatcherMetrics>,
    logger: StructuredLogger,
    state: watch::Sender<LoopState>,
}

impl Controller {
    pub fn new(queue: WorkQueue<SyncKey>, reconciler: Arc<Reconciler>, config: ControllerConfig) -> Self {
        let (state, _) = watch::channel(LoopState::WaitingForSync);
        Self {
            queue,
            reconciler,
            config,
            observer: Arc::new(LoggingErrorObserver),
            health: HealthRegistry::default(),
            metrics: None,
            logger: StructuredLogger::new("default"),
            state,
        }
    }

    /// Handle to the controller's queue
    pub fn queue(&self) -> &WorkQueue<SyncKey> {
        &self.queue
    }

    /// Request a reconciliation
    pub fn schedule_sync(&self) {
        self.queue.add(SyncKey);
    }

    /// Observe lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LoopState) {
        debug!(state = %next, "Controller state transition");
        self.state.send_replace(next);
    }

    /// Run until `shutdown` fires.
    ///
    /// Returns an error without starting any worker if the cache does not
    /// sync within the configured timeout or a stop arrives first.
    pub async fn run(
        self,
        mut synced: watch::Receiver<bool>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ControllerError> {
        info!("Waiting for cache sync");
        self.transition(LoopState::WaitingForSync);
        let started = Instant::now();

        let outcome = tokio::select! {
            res = tokio::time::timeout(self.config.cache_sync_timeout, wait_for_sync(&mut synced)) => {
                match res {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(ControllerError::StoppedBeforeSync),
                    Err(_) => Err(ControllerError::CacheSyncTimeout(self.config.cache_sync_timeout)),
                }
            }
            _ = shutdown.recv() => Err(ControllerError::StoppedBeforeSync),
        };

        if let Err(e) = outcome {
            error!(error = %e, "Cache sync failed, not starting workers");
            self.queue.shut_down();
            self.transition(LoopState::Stopped);
            return Err(e);
        }

        self.logger.log_cache_synced(started.elapsed().as_millis());
        self.health.set_synced(true).await;
        self.transition(LoopState::Running);

        let workers = self.config.workers.max(1);
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.queue.clone(),
                    reconciler: Arc::clone(&self.reconciler),
                    observer: Arc::clone(&self.observer),
                    health: self.health.clone(),
                    metrics: self.metrics.clone(),
                    logger: self.logger.clone(),
                    sync_timeout: self.config.sync_timeout,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        // Anything that changed while we were waiting is reflected in the
        // first pass.
        self.schedule_sync();

        info!(workers = workers, "Waiting for stop signal");
        let _ = shutdown.recv().await;
        info!("Received stop signal");

        self.transition(LoopState::Draining);
        info!("Shutting down queue");
        self.queue.shut_down();

        info!("Shutting down workers");
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }
        info!("Workers are all done");

        self.transition(LoopState::Stopped);
        Ok(())
    }
}

/// Resolves to true once `synced` reads true, false if the sender is gone
async fn wait_for_sync(synced: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *synced.borrow_and_update() {
            return true;
        }
        if synced.changed().await.is_err() {
            return *synced.borrow();
        }
    }
}

struct Worker {
    id: usize,
    queue: WorkQueue<SyncKey>,
    reconciler: Arc<Reconciler>,
    observer: Arc<dyn ErrorObserver>,
    health: HealthRegistry,
    metrics: Option<WatcherMetrics>,
    logger: StructuredLogger,
    sync_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while self.process_next_work_item().await {}
        debug!(worker = self.id, "Worker stopped");
    }

    /// Handle one key; false once the queue has shut down
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(self.sync_timeout, self.reconciler.sync()).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::DeadlineExceeded(self.sync_timeout)),
        };
        let elapsed = start.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_reconcile_duration(elapsed.as_secs_f64());
        }

        match result {
            Ok(report) => {
                self.queue.forget(&key);
                self.health.record_success(components::RECONCILER).await;
                if let Some(metrics) = &self.metrics {
                    metrics.inc_reconcile_success();
                    metrics.set_correlated_workloads(report.results.len() as i64);
                    metrics.inc_skipped_entries(report.skipped.len() as u64);
                }
                self.logger
                    .log_reconcile(report.results.len(), report.skipped.len(), elapsed.as_millis());
            }
            Err(err) => {
                self.observer.observe(&err);
                self.health
                    .record_failure(components::RECONCILER, err.to_string())
                    .await;
                let delay = self.queue.add_rate_limited(key);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_reconcile_failure();
                    metrics.inc_requeues();
                }
                warn!(
                    worker = self.id,
                    retries = self.queue.num_requeues(&key),
                    delay_ms = delay.as_millis() as u64,
                    "Sync requeued with backoff"
                );
            }
        }

        self.queue.done(&key);
        true
    }
}

/// Builder for creating the controller
pub struct ControllerBuilder {
    queue: Option<WorkQueue<SyncKey>>,
    reconciler: Option<Arc<Reconciler>>,
    config: ControllerConfig,
    observer: Option<Arc<dyn ErrorObserver>>,
    health: Option<HealthRegistry>,
    metrics: Option<WatcherMetrics>,
    logger: Option<StructuredLogger>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            queue: None,
            reconciler: None,
            config: ControllerConfig::default(),
            observer: None,
            health: None,
            metrics: None,
            logger: None,
        }
    }

    pub fn queue(mut self, queue: WorkQueue<SyncKey>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn reconciler(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.cache_sync_timeout = timeout;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = timeout;
        self
    }

    pub fn error_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: WatcherMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<Controller> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("Work queue is required"))?;
        let reconciler = self
            .reconciler
            .ok_or_else(|| anyhow::anyhow!("Reconciler is required"))?;

        let mut controller = Controller::new(queue, reconciler, self.config);
        if let Some(observer) = self.observer {
            controller.observer = observer;
        }
        if let Some(health) = self.health {
            controller.health = health;
        }
        if let Some(logger) = self.logger {
            controller.logger = logger;
        }
        controller.metrics = self.metrics;
        Ok(controller)
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
