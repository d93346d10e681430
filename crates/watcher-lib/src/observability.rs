//! Observability infrastructure for the limit watcher
//!
//! Provides:
//! - Prometheus metrics (reconcile latency and outcomes, queue activity,
//!   per-container limit utilization)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, GaugeVec, Opts, Registry,
};
use tracing::{info, warn};

/// Histogram buckets for reconcile duration (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Prometheus metrics for the controller
///
/// Cheap to clone; clones share the underlying collectors.
#[derive(Clone)]
pub struct WatcherMetrics {
    reconcile_duration_seconds: Histogram,
    reconcile_total: IntCounterVec,
    requeues_total: IntCounter,
    queue_adds_total: IntCounter,
    correlated_workloads: IntGauge,
    skipped_entries_total: IntCounter,
    usage_percent: GaugeVec,
}

impl WatcherMetrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            reconcile_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "limit_watcher_reconcile_duration_seconds",
                    "Time spent in one reconciliation pass",
                )
                .buckets(RECONCILE_BUCKETS.to_vec()),
            )?,
            reconcile_total: IntCounterVec::new(
                Opts::new(
                    "limit_watcher_reconcile_total",
                    "Reconciliation passes by result",
                ),
                &["result"],
            )?,
            requeues_total: IntCounter::new(
                "limit_watcher_requeues_total",
                "Rate limited retries scheduled after failed passes",
            )?,
            queue_adds_total: IntCounter::new(
                "limit_watcher_queue_adds_total",
                "Sync requests received from workload events",
            )?,
            correlated_workloads: IntGauge::new(
                "limit_watcher_correlated_workloads",
                "Workloads with limits and usage in the last pass",
            )?,
            skipped_entries_total: IntCounter::new(
                "limit_watcher_skipped_entries_total",
                "Resource entries that could not be computed",
            )?,
            usage_percent: GaugeVec::new(
                Opts::new(
                    "limit_watcher_usage_percent",
                    "Current usage as a percentage of the declared limit",
                ),
                &["namespace", "workload", "container", "resource"],
            )?,
        };

        registry.register(Box::new(metrics.reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.reconcile_total.clone()))?;
        registry.register(Box::new(metrics.requeues_total.clone()))?;
        registry.register(Box::new(metrics.queue_adds_total.clone()))?;
        registry.register(Box::new(metrics.correlated_workloads.clone()))?;
        registry.register(Box::new(metrics.skipped_entries_total.clone()))?;
        registry.register(Box::new(metrics.usage_percent.clone()))?;

        Ok(metrics)
    }

    pub fn observe_reconcile_duration(&self, duration_secs: f64) {
        self.reconcile_duration_seconds.observe(duration_secs);
    }

    pub fn inc_reconcile_success(&self) {
        self.reconcile_total.with_label_values(&["success"]).inc();
    }

    pub fn inc_reconcile_failure(&self) {
        self.reconcile_total.with_label_values(&["failure"]).inc();
    }

    pub fn inc_requeues(&self) {
        self.requeues_total.inc();
    }

    pub fn inc_queue_adds(&self) {
        self.queue_adds_total.inc();
    }

    pub fn set_correlated_workloads(&self, count: i64) {
        self.correlated_workloads.set(count);
    }

    pub fn inc_skipped_entries(&self, count: u64) {
        self.skipped_entries_total.inc_by(count);
    }

    /// Drop all per-container utilization series
    pub fn reset_usage(&self) {
        self.usage_percent.reset();
    }

    pub fn set_usage_percent(
        &self,
        namespace: &str,
        workload: &str,
        container: &str,
        resource: &str,
        percent: f64,
    ) {
        self.usage_percent
            .with_label_values(&[namespace, workload, container, resource])
            .set(percent);
    }

    pub fn reconcile_count(&self, result: &str) -> u64 {
        self.reconcile_total.with_label_values(&[result]).get()
    }

    pub fn requeue_count(&self) -> u64 {
        self.requeues_total.get()
    }
}

/// Structured logger for controller lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn log_startup(&self, version: &str, workers: usize) {
        info!(
            event = "watcher_started",
            cluster = %self.cluster,
            version = %version,
            workers = workers,
            "Limit watcher started"
        );
    }

    pub fn log_cache_synced(&self, waited_ms: u128) {
        info!(
            event = "cache_synced",
            cluster = %self.cluster,
            waited_ms = waited_ms as u64,
            "Caches are synced"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "watcher_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Limit watcher shutting down"
        );
    }

    pub fn log_reconcile(&self, correlated: usize, skipped: usize, elapsed_ms: u128) {
        if skipped > 0 {
            warn!(
                event = "reconcile_complete",
                cluster = %self.cluster,
                correlated = correlated,
                skipped = skipped,
                elapsed_ms = elapsed_ms as u64,
                "Reconciliation finished with skipped entries"
            );
        } else {
            info!(
                event = "reconcile_complete",
                cluster = %self.cluster,
                correlated = correlated,
                elapsed_ms = elapsed_ms as u64,
                "Reconciliation finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_record() {
        let registry = Registry::new();
        let metrics = WatcherMetrics::new(&registry).unwrap();

        metrics.observe_reconcile_duration(0.01);
        metrics.inc_reconcile_success();
        metrics.inc_reconcile_failure();
        metrics.inc_reconcile_failure();
        metrics.inc_requeues();
        metrics.inc_queue_adds();
        metrics.set_correlated_workloads(3);
        metrics.inc_skipped_entries(2);
        metrics.set_usage_percent("default", "a", "app", "cpu", 50.0);

        assert_eq!(metrics.reconcile_count("success"), 1);
        assert_eq!(metrics.reconcile_count("failure"), 2);
        assert_eq!(metrics.requeue_count(), 1);

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"limit_watcher_usage_percent".to_string()));
        assert!(names.contains(&"limit_watcher_reconcile_total".to_string()));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        WatcherMetrics::new(&registry).unwrap();
        assert!(WatcherMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_reset_usage_drops_series() {
        let registry = Registry::new();
        let metrics = WatcherMetrics::new(&registry).unwrap();
        metrics.set_usage_percent("default", "a", "app", "cpu", 50.0);
        metrics.reset_usage();

        let family = registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "limit_watcher_usage_percent");
        assert!(family.map(|f| f.get_metric().is_empty()).unwrap_or(true));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-cluster");
        assert_eq!(logger.cluster, "test-cluster");
    }
}
