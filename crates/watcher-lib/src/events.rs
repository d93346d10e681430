//! Workload change notifications
//!
//! Pods are watched through the kube runtime watcher. The raw watch stream
//! only reports applied and deleted objects plus full relists, so a
//! dispatcher keeps the last seen version of each object and turns the
//! stream into add, update and delete callbacks. Every callback enqueues
//! the single sync key; the payload itself is only logged.

use crate::health::{components, HealthRegistry};
use crate::models::{SyncKey, WorkloadId};
use crate::observability::WatcherMetrics;
use crate::queue::WorkQueue;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Default period after which every known object is re-delivered as an update
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(120);

/// Why the event loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopExit {
    /// Stop signal received
    Shutdown,
    /// The watch stream terminated; no further events will arrive
    StreamEnded,
}

/// Callbacks for workload changes
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/// Identity of a watched object
pub fn object_id<K: Resource>(obj: &K) -> WorkloadId {
    WorkloadId::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Turns every notification into a sync request
#[derive(Clone)]
pub struct QueueEventHandler {
    queue: WorkQueue<SyncKey>,
    metrics: Option<WatcherMetrics>,
}

impl QueueEventHandler {
    pub fn new(queue: WorkQueue<SyncKey>) -> Self {
        Self {
            queue,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: WatcherMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn enqueue(&self) {
        self.queue.add(SyncKey);
        if let Some(metrics) = &self.metrics {
            metrics.inc_queue_adds();
        }
    }
}

impl<K: Resource> EventHandler<K> for QueueEventHandler {
    fn on_add(&self, obj: &K) {
        info!(workload = %object_id(obj), "Pod added");
        self.enqueue();
    }

    fn on_update(&self, _old: &K, new: &K) {
        debug!(workload = %object_id(new), "Pod updated");
        self.enqueue();
    }

    fn on_delete(&self, obj: &K) {
        info!(workload = %object_id(obj), "Pod deleted");
        self.enqueue();
    }
}

/// Converts watch events into handler callbacks
pub struct EventDispatcher<K> {
    handler: Arc<dyn EventHandler<K>>,
    known: HashMap<WorkloadId, K>,
    synced: bool,
}

impl<K: Resource + Clone> EventDispatcher<K> {
    pub fn new(handler: Arc<dyn EventHandler<K>>) -> Self {
        Self {
            handler,
            known: HashMap::new(),
            synced: false,
        }
    }

    /// True once the first full listing has been applied
    pub fn has_synced(&self) -> bool {
        self.synced
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn apply(&mut self, event: Event<K>) {
        match event {
            Event::Applied(obj) => {
                let id = object_id(&obj);
                match self.known.insert(id, obj.clone()) {
                    Some(old) => self.handler.on_update(&old, &obj),
                    None => self.handler.on_add(&obj),
                }
            }
            Event::Deleted(obj) => {
                let id = object_id(&obj);
                let last = self.known.remove(&id).unwrap_or_else(|| obj.clone());
                self.handler.on_delete(&last);
            }
            Event::Restarted(objs) => {
                let mut previous = std::mem::take(&mut self.known);
                for obj in objs {
                    let id = object_id(&obj);
                    match previous.remove(&id) {
                        Some(old) if old.resource_version() != obj.resource_version() => {
                            self.handler.on_update(&old, &obj)
                        }
                        Some(_) => {}
                        None => self.handler.on_add(&obj),
                    }
                    self.known.insert(id, obj);
                }
                for gone in previous.values() {
                    self.handler.on_delete(gone);
                }
                self.synced = true;
            }
        }
    }

    /// Re-deliver every known object as an unchanged update
    pub fn resync(&self) {
        debug!(objects = self.known.len(), "Resyncing watched objects");
        for obj in self.known.values() {
            self.handler.on_update(obj, obj);
        }
    }
}

/// Drive a dispatcher from a watch stream until shutdown or stream end.
///
/// `synced` flips to true after the first full listing has been delivered.
/// A stream that ends marks the event source unhealthy.
pub async fn run_event_loop<K, S>(
    stream: S,
    mut dispatcher: EventDispatcher<K>,
    synced: watch::Sender<bool>,
    resync_period: Duration,
    health: Option<HealthRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) -> EventLoopExit
where
    K: Resource + Clone,
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    let mut stream = Box::pin(stream);
    let resync_enabled = !resync_period.is_zero();
    let period = if resync_enabled {
        resync_period
    } else {
        DEFAULT_RESYNC_PERIOD
    };
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(Ok(event)) => {
                        dispatcher.apply(event);
                        if let Some(health) = &health {
                            health.record_success(components::EVENT_SOURCE).await;
                        }
                        if dispatcher.has_synced() && !*synced.borrow() {
                            info!(objects = dispatcher.len(), "Workload cache synced");
                            synced.send_replace(true);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Watch stream error, retrying with backoff");
                        if let Some(health) = &health {
                            health
                                .record_failure(components::EVENT_SOURCE, e.to_string())
                                .await;
                        }
                    }
                    None => {
                        error!("Watch stream ended, no further workload events");
                        if let Some(health) = &health {
                            health
                                .set_unhealthy(components::EVENT_SOURCE, "watch stream ended")
                                .await;
                        }
                        return EventLoopExit::StreamEnded;
                    }
                }
            }
            _ = ticker.tick(), if resync_enabled => {
                dispatcher.resync();
            }
            _ = shutdown.recv() => {
                info!("Shutting down event source");
                return EventLoopExit::Shutdown;
            }
        }
    }
}

/// Watches pods outside the excluded namespace
pub struct PodEventSource {
    api: Api<Pod>,
    config: watcher::Config,
    resync_period: Duration,
    health: Option<HealthRegistry>,
}

impl PodEventSource {
    pub fn new(client: Client, excluded_namespace: &str) -> Self {
        let selector = crate::catalog::namespace_field_selector(excluded_namespace);
        Self {
            api: Api::all(client),
            config: watcher::Config::default().fields(&selector),
            resync_period: DEFAULT_RESYNC_PERIOD,
            health: None,
        }
    }

    /// Zero disables periodic resync
    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Start watching in a background task.
    ///
    /// Returns the cache-synced signal and the task handle.
    pub fn spawn(
        self,
        handler: Arc<dyn EventHandler<Pod>>,
        shutdown: broadcast::Receiver<()>,
    ) -> (watch::Receiver<bool>, JoinHandle<EventLoopExit>) {
        let (synced_tx, synced_rx) = watch::channel(false);
        let stream = watcher(self.api, self.config).default_backoff();
        let dispatcher = EventDispatcher::new(handler);

        info!(
            resync_secs = self.resync_period.as_secs(),
            "Starting pod event source"
        );
        let handle = tokio::spawn(run_event_loop(
            stream,
            dispatcher,
            synced_tx,
            self.resync_period,
            self.health,
            shutdown,
        ));
        (synced_rx, handle)
    }
}
