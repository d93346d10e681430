//! One reconciliation pass
//!
//! Refreshes both catalogs, correlates them and hands the report to the
//! configured sinks. Either refresh failing aborts the pass before anything
//! is emitted.

use crate::catalog::{ResourceCatalog, UsageCatalog};
use crate::correlator::{correlate, SkippedEntry};
use crate::error::ReconcileError;
use crate::models::CorrelatedResult;
use crate::sink::ResultSink;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a successful reconciliation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Sorted by workload identity
    pub results: Vec<CorrelatedResult>,
    pub skipped: Vec<SkippedEntry>,
    /// Workloads returned by the resource catalog
    pub workloads: usize,
    /// Workloads declaring at least one limit
    pub limited_workloads: usize,
    pub usage_snapshots: usize,
}

/// Runs the synchronization step against a pair of catalogs
pub struct Reconciler {
    resources: Arc<ResourceCatalog>,
    usage: Arc<UsageCatalog>,
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl Reconciler {
    pub fn new(resources: Arc<ResourceCatalog>, usage: Arc<UsageCatalog>) -> Self {
        Self {
            resources,
            usage,
            sinks: Vec::new(),
        }
    }

    /// Add a sink receiving every successful report
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Refresh both catalogs and correlate them
    pub async fn sync(&self) -> Result<SyncReport, ReconcileError> {
        debug!("Starting sync");

        let (workloads, usage) = tokio::try_join!(
            self.resources.refresh_and_list(),
            self.usage.refresh_and_list()
        )?;

        let correlation = correlate(&workloads, &usage);
        let report = SyncReport {
            results: correlation.results,
            skipped: correlation.skipped,
            workloads: workloads.len(),
            limited_workloads: correlation.limited_workloads,
            usage_snapshots: usage.len(),
        };

        for sink in &self.sinks {
            sink.emit(&report);
        }

        debug!(
            workloads = report.workloads,
            limited = report.limited_workloads,
            usage_snapshots = report.usage_snapshots,
            correlated = report.results.len(),
            "Finished sync"
        );
        Ok(report)
    }
}
