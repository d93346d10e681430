//! Result sinks
//!
//! The reconciler hands every successful report to its sinks. How the
//! numbers are presented is up to the sink.

use crate::controller::SyncReport;
use crate::observability::WatcherMetrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Receives the outcome of each successful reconciliation
pub trait ResultSink: Send + Sync {
    fn emit(&self, report: &SyncReport);
}

/// Percentage as reported in logs, two decimals
pub fn format_percentage(percentage: f64) -> String {
    format!("{:.2}", percentage)
}

/// Logs one structured event per container resource
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn emit(&self, report: &SyncReport) {
        for result in &report.results {
            for (container, utilization) in result.utilizations() {
                info!(
                    event = "limit_usage",
                    workload = %result.id.name,
                    namespace = %result.id.namespace,
                    container = %container,
                    resource = %utilization.resource,
                    usage = %utilization.usage,
                    limit = %utilization.limit,
                    percentage = %format_percentage(utilization.percentage),
                    "Resource usage against limit"
                );
            }
        }
    }
}

/// Publishes utilization as Prometheus gauges
///
/// Series are rebuilt on every pass so removed workloads disappear.
#[derive(Clone)]
pub struct MetricsSink {
    metrics: WatcherMetrics,
}

impl MetricsSink {
    pub fn new(metrics: WatcherMetrics) -> Self {
        Self { metrics }
    }
}

impl ResultSink for MetricsSink {
    fn emit(&self, report: &SyncReport) {
        self.metrics.reset_usage();
        for result in &report.results {
            for (container, utilization) in result.utilizations() {
                self.metrics.set_usage_percent(
                    &result.id.namespace,
                    &result.id.name,
                    container,
                    &utilization.resource,
                    utilization.percentage,
                );
            }
        }
    }
}

/// Keeps every emitted report in memory
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    reports: Arc<Mutex<Vec<SyncReport>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<SyncReport> {
        self.reports.lock().clone()
    }

    pub fn last(&self) -> Option<SyncReport> {
        self.reports.lock().last().cloned()
    }
}

impl ResultSink for CollectingSink {
    fn emit(&self, report: &SyncReport) {
        self.reports.lock().push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerUtilization, CorrelatedResult, ResourceUtilization, WorkloadId};
    use crate::quantity::Quantity;
    use prometheus::Registry;

    fn report(names: &[&str]) -> SyncReport {
        SyncReport {
            results: names
                .iter()
                .map(|name| CorrelatedResult {
                    id: WorkloadId::new("default", *name),
                    containers: vec![ContainerUtilization {
                        container: "app".to_string(),
                        resources: vec![ResourceUtilization {
                            resource: "cpu".to_string(),
                            usage: Quantity::from("250m"),
                            limit: Quantity::from("500m"),
                            percentage: 50.0,
                        }],
                    }],
                })
                .collect(),
            ..Default::default()
        }
    }

    fn usage_series(registry: &Registry) -> usize {
        registry
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "limit_watcher_usage_percent")
            .map(|f| f.get_metric().len())
            .unwrap_or(0)
    }

    #[test]
    fn test_metrics_sink_replaces_series() {
        let registry = Registry::new();
        let sink = MetricsSink::new(WatcherMetrics::new(&registry).unwrap());

        sink.emit(&report(&["a", "b"]));
        assert_eq!(usage_series(&registry), 2);

        sink.emit(&report(&["a"]));
        assert_eq!(usage_series(&registry), 1);
    }

    #[test]
    fn test_collecting_sink_keeps_reports() {
        let sink = CollectingSink::new();
        sink.emit(&report(&["a"]));
        sink.emit(&report(&["a", "b"]));

        assert_eq!(sink.reports().len(), 2);
        assert_eq!(sink.last().unwrap().results.len(), 2);
    }

    #[test]
    fn test_percentage_has_two_decimals() {
        let report = report(&["a"]);
        let (_, cpu) = report.results[0].utilizations().next().unwrap();
        assert_eq!(format_percentage(cpu.percentage), "50.00");

        assert_eq!(format_percentage(100.0 / 3.0), "33.33");
        assert_eq!(format_percentage(200.0 / 3.0), "66.67");
        assert_eq!(format_percentage(0.0), "0.00");
        assert_eq!(format_percentage(150.0), "150.00");
    }
}
