//! Library for watching container resource usage against declared limits
//!
//! This crate provides the core functionality for:
//! - A deduplicating, rate-limited work queue
//! - Workload and usage catalogs backed by the Kubernetes API
//! - Correlation of usage with limits
//! - The reconcile loop and its change notifications
//! - Health checks and observability

pub mod catalog;
pub mod controller;
pub mod correlator;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod observability;
pub mod quantity;
pub mod queue;
pub mod sink;

pub use catalog::{Catalog, ListSource, PodCatalog, PodMetricsCatalog, ResourceCatalog, UsageCatalog};
pub use controller::{Controller, ControllerBuilder, ControllerConfig, LoopState, Reconciler, SyncReport};
pub use correlator::{correlate, Correlation, SkippedEntry};
pub use error::{CatalogError, ControllerError, EntryError, ReconcileError};
pub use events::{EventHandler, EventLoopExit, PodEventSource, QueueEventHandler};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, WatcherMetrics};
pub use quantity::{Quantity, QuantityError};
pub use queue::{BackoffConfig, WorkQueue};
pub use sink::{LogSink, MetricsSink, ResultSink};
