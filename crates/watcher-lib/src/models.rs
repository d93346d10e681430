//! Core data models for the limit watcher

use crate::quantity::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource dimension name -> quantity (e.g. `cpu` -> `500m`)
pub type ResourceList = BTreeMap<String, Quantity>;

/// Identity of a workload, used as the join key between catalogs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Declared limits of a single container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLimits {
    pub name: String,
    /// Empty when the container declares no limits
    #[serde(default)]
    pub limits: ResourceList,
}

/// A workload and its per-container resource limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: WorkloadId,
    pub containers: Vec<ContainerLimits>,
}

impl Workload {
    /// True if at least one container declares a non-empty limits map
    pub fn has_limits(&self) -> bool {
        self.containers.iter().any(|c| !c.limits.is_empty())
    }
}

/// Measured usage of a single container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    #[serde(default)]
    pub usage: ResourceList,
}

/// Point-in-time resource usage of a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub id: WorkloadId,
    pub containers: Vec<ContainerUsage>,
    /// Sample timestamp as reported by the metrics API
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Sampling window as reported by the metrics API
    #[serde(default)]
    pub window: Option<String>,
}

/// Usage against limit for one resource dimension of one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub resource: String,
    pub usage: Quantity,
    pub limit: Quantity,
    /// 100 * usage / limit
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUtilization {
    pub container: String,
    pub resources: Vec<ResourceUtilization>,
}

/// A workload present both in the limited index and in the usage catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedResult {
    pub id: WorkloadId,
    pub containers: Vec<ContainerUtilization>,
}

impl CorrelatedResult {
    /// Iterate over (container, utilization) pairs
    pub fn utilizations(&self) -> impl Iterator<Item = (&str, &ResourceUtilization)> {
        self.containers.iter().flat_map(|c| {
            c.resources
                .iter()
                .map(move |r| (c.container.as_str(), r))
        })
    }
}

/// The single token used by the controller's work queue.
///
/// Every workload event collapses onto this key, so at most one
/// reconciliation is ever pending or in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyncKey;

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sync")
    }
}
