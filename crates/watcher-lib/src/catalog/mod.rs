//! Read-only workload and usage catalogs
//!
//! A catalog keeps the last fetched snapshot of a collection and can be
//! asked to refresh it. Snapshots are replaced wholesale so readers never
//! observe a partially updated list. Fetch failures are returned to the
//! caller untouched; retrying is the work queue's job.

mod k8s;

pub use k8s::{
    namespace_field_selector, pod_metrics_to_usage, pod_to_workload, PodMetrics,
    PodMetricsContainer, PodMetricsList, PodMetricsSource, PodSource,
    DEFAULT_EXCLUDED_NAMESPACE,
};

use crate::error::CatalogError;
use crate::models::{UsageSnapshot, Workload};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// A collection that can be listed from cache or refreshed
#[async_trait]
pub trait Catalog: Send + Sync {
    type Item: Send + Sync;

    /// Last fetched snapshot, without any I/O
    fn list(&self) -> Arc<Vec<Self::Item>>;

    /// Fetch a fresh snapshot, store it and return it
    async fn refresh_and_list(&self) -> Result<Arc<Vec<Self::Item>>, CatalogError>;
}

/// Fetches the full contents of a collection
#[async_trait]
pub trait ListSource: Send + Sync {
    type Item: Send + Sync;

    /// Name used in logs and errors
    fn name(&self) -> &'static str;

    async fn fetch(&self) -> Result<Vec<Self::Item>, CatalogError>;
}

/// Catalog holding the latest snapshot of a [`ListSource`]
pub struct SnapshotCatalog<S: ListSource> {
    source: S,
    snapshot: RwLock<Arc<Vec<S::Item>>>,
}

impl<S: ListSource> SnapshotCatalog<S> {
    /// Create an empty catalog; nothing is fetched until the first refresh
    pub fn new(source: S) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

#[async_trait]
impl<S: ListSource> Catalog for SnapshotCatalog<S> {
    type Item = S::Item;

    fn list(&self) -> Arc<Vec<S::Item>> {
        Arc::clone(&self.snapshot.read())
    }

    async fn refresh_and_list(&self) -> Result<Arc<Vec<S::Item>>, CatalogError> {
        let items = Arc::new(self.source.fetch().await?);
        debug!(
            catalog = self.source.name(),
            count = items.len(),
            "Catalog refreshed"
        );
        *self.snapshot.write() = Arc::clone(&items);
        Ok(items)
    }
}

/// Catalog of workloads and their declared limits
pub type ResourceCatalog = dyn Catalog<Item = Workload>;

/// Catalog of per-workload usage snapshots
pub type UsageCatalog = dyn Catalog<Item = UsageSnapshot>;

/// Workload catalog backed by the core/v1 Pod API
pub type PodCatalog = SnapshotCatalog<PodSource>;

/// Usage catalog backed by the metrics.k8s.io PodMetrics API
pub type PodMetricsCatalog = SnapshotCatalog<PodMetricsSource>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ListSource for CountingSource {
        type Item = Workload;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch(&self) -> Result<Vec<Workload>, CatalogError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CatalogError::unavailable("counting", "boom"));
            }
            Ok((0..=call)
                .map(|i| Workload {
                    id: WorkloadId::new("default", format!("pod-{}", i)),
                    containers: vec![],
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_list_is_empty_before_refresh() {
        let catalog = SnapshotCatalog::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        assert!(catalog.list().is_empty());
        assert_eq!(catalog.source().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let catalog = SnapshotCatalog::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let first = catalog.refresh_and_list().await.unwrap();
        assert_eq!(first.len(), 1);

        let held = catalog.list();
        let second = catalog.refresh_and_list().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(catalog.list().len(), 2);

        // Earlier readers keep their own consistent snapshot
        assert_eq!(held.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let catalog = SnapshotCatalog::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail: true,
        });

        let err = catalog.refresh_and_list().await.unwrap_err();
        assert_eq!(err.catalog(), "counting");
        assert!(catalog.list().is_empty());
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let catalog: Arc<ResourceCatalog> = Arc::new(SnapshotCatalog::new(CountingSource {
            calls: AtomicUsize::new(0),
            fail: false,
        }));
        assert_eq!(catalog.refresh_and_list().await.unwrap().len(), 1);
    }
}
