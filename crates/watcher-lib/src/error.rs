//! Error types for the limit watcher

use crate::quantity::QuantityError;
use std::time::Duration;
use thiserror::Error;

/// Failure to fetch a catalog snapshot
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to list {catalog}: {source}")]
    Api {
        catalog: &'static str,
        #[source]
        source: kube::Error,
    },

    #[error("{catalog} unavailable: {message}")]
    Unavailable {
        catalog: &'static str,
        message: String,
    },
}

impl CatalogError {
    pub fn unavailable(catalog: &'static str, message: impl Into<String>) -> Self {
        CatalogError::Unavailable {
            catalog,
            message: message.into(),
        }
    }

    pub fn catalog(&self) -> &'static str {
        match self {
            CatalogError::Api { catalog, .. } | CatalogError::Unavailable { catalog, .. } => {
                catalog
            }
        }
    }
}

/// Failure to compute a single (container, resource) entry
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntryError {
    #[error("limit is zero")]
    ZeroLimit,

    #[error("limit {0} is not a positive finite value")]
    InvalidLimit(f64),

    #[error("usage {0} is not a non-negative finite value")]
    InvalidUsage(f64),

    #[error("usage {usage} against limit {limit} does not give a finite percentage")]
    NonFinitePercentage { usage: f64, limit: f64 },

    #[error("no limit declared for a measured resource")]
    MissingLimit,

    #[error("container has limits but no usage sample")]
    MissingUsage,

    #[error("unparsable quantity: {0}")]
    Quantity(#[from] QuantityError),
}

/// Failure of a whole synchronization step
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("catalog refresh failed: {0}")]
    Catalog(#[from] CatalogError),

    #[error("synchronization exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

/// Startup failures of the reconcile loop
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("timed out after {0:?} waiting for cache sync")]
    CacheSyncTimeout(Duration),

    #[error("stop requested before caches synced")]
    StoppedBeforeSync,
}
