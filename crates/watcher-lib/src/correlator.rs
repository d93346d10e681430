//! Join workloads against usage snapshots and compute limit utilization
//!
//! Only workloads declaring at least one limit take part. Each usage
//! snapshot whose identity matches such a workload yields exactly one
//! [`CorrelatedResult`]; unmatched snapshots are dropped. Entries whose
//! percentage cannot be computed (zero limit, bad quantity, ...) are
//! skipped and reported, the rest of the pass continues.

use crate::error::EntryError;
use crate::models::{
    ContainerLimits, ContainerUsage, ContainerUtilization, CorrelatedResult, ResourceUtilization,
    UsageSnapshot, Workload, WorkloadId,
};
use crate::quantity::Quantity;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Workloads that declare at least one limit, keyed by identity
#[derive(Debug, Default)]
pub struct LimitedWorkloadIndex<'a> {
    workloads: HashMap<&'a WorkloadId, &'a Workload>,
}

impl<'a> LimitedWorkloadIndex<'a> {
    pub fn build(workloads: &'a [Workload]) -> Self {
        let workloads = workloads
            .iter()
            .filter(|w| w.has_limits())
            .map(|w| (&w.id, w))
            .collect();
        Self { workloads }
    }

    pub fn get(&self, id: &WorkloadId) -> Option<&'a Workload> {
        self.workloads.get(id).copied()
    }

    pub fn contains(&self, id: &WorkloadId) -> bool {
        self.workloads.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty()
    }
}

/// An entry left out of a correlated result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedEntry {
    pub workload: WorkloadId,
    pub container: String,
    pub resource: Option<String>,
    #[serde(serialize_with = "serialize_reason")]
    pub reason: EntryError,
}

fn serialize_reason<S: serde::Serializer>(reason: &EntryError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(reason)
}

/// Output of one correlation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Correlation {
    /// Sorted by workload identity
    pub results: Vec<CorrelatedResult>,
    pub skipped: Vec<SkippedEntry>,
    pub limited_workloads: usize,
}

/// Correlate workloads with usage snapshots
pub fn correlate(workloads: &[Workload], usage: &[UsageSnapshot]) -> Correlation {
    let index = LimitedWorkloadIndex::build(workloads);
    let mut correlation = Correlation {
        limited_workloads: index.len(),
        ..Default::default()
    };

    for snapshot in usage {
        let Some(workload) = index.get(&snapshot.id) else {
            continue;
        };
        let result = correlate_workload(workload, snapshot, &mut correlation.skipped);
        correlation.results.push(result);
    }

    correlation.results.sort_by(|a, b| a.id.cmp(&b.id));
    correlation
}

fn correlate_workload(
    workload: &Workload,
    snapshot: &UsageSnapshot,
    skipped: &mut Vec<SkippedEntry>,
) -> CorrelatedResult {
    let usage_by_container: HashMap<&str, &ContainerUsage> = snapshot
        .containers
        .iter()
        .map(|c| (c.name.as_str(), c))
        .collect();

    let mut containers = Vec::new();
    for spec in workload.containers.iter().filter(|c| !c.limits.is_empty()) {
        let Some(usage) = usage_by_container.get(spec.name.as_str()) else {
            debug!(
                workload = %workload.id,
                container = %spec.name,
                "No usage sample for limited container"
            );
            skipped.push(SkippedEntry {
                workload: workload.id.clone(),
                container: spec.name.clone(),
                resource: None,
                reason: EntryError::MissingUsage,
            });
            continue;
        };

        containers.push(ContainerUtilization {
            container: spec.name.clone(),
            resources: correlate_container(&workload.id, spec, usage, skipped),
        });
    }

    CorrelatedResult {
        id: workload.id.clone(),
        containers,
    }
}

fn correlate_container(
    id: &WorkloadId,
    spec: &ContainerLimits,
    usage: &ContainerUsage,
    skipped: &mut Vec<SkippedEntry>,
) -> Vec<ResourceUtilization> {
    let mut resources = Vec::new();

    for (resource, used) in &usage.usage {
        let entry = match spec.limits.get(resource) {
            Some(limit) => utilization(resource, used, limit),
            None => Err(EntryError::MissingLimit),
        };

        match entry {
            Ok(utilization) => resources.push(utilization),
            Err(reason) => {
                if matches!(reason, EntryError::MissingLimit) {
                    debug!(workload = %id, container = %spec.name, resource = %resource, "No limit for measured resource");
                } else {
                    warn!(
                        workload = %id,
                        container = %spec.name,
                        resource = %resource,
                        reason = %reason,
                        "Skipping resource entry"
                    );
                }
                skipped.push(SkippedEntry {
                    workload: id.clone(),
                    container: spec.name.clone(),
                    resource: Some(resource.clone()),
                    reason,
                });
            }
        }
    }

    resources
}

/// Compute usage as a percentage of limit for one resource
pub fn utilization(
    resource: &str,
    usage: &Quantity,
    limit: &Quantity,
) -> Result<ResourceUtilization, EntryError> {
    let used = usage.to_f64()?;
    let max = limit.to_f64()?;
    if max == 0.0 {
        return Err(EntryError::ZeroLimit);
    }
    if !max.is_finite() || max < 0.0 {
        return Err(EntryError::InvalidLimit(max));
    }
    if !used.is_finite() || used < 0.0 {
        return Err(EntryError::InvalidUsage(used));
    }

    let percentage = 100.0 * used / max;
    if !percentage.is_finite() {
        return Err(EntryError::NonFinitePercentage {
            usage: used,
            limit: max,
        });
    }

    Ok(ResourceUtilization {
        resource: resource.to_string(),
        usage: usage.clone(),
        limit: limit.clone(),
        percentage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn workload(ns: &str, name: &str, containers: &[(&str, &[(&str, &str)])]) -> Workload {
        Workload {
            id: WorkloadId::new(ns, name),
            containers: containers
                .iter()
                .map(|(cname, limits)| ContainerLimits {
                    name: cname.to_string(),
                    limits: limits
                        .iter()
                        .map(|(k, v)| (k.to_string(), Quantity::from(*v)))
                        .collect(),
                })
                .collect(),
        }
    }

    fn usage(ns: &str, name: &str, containers: &[(&str, &[(&str, &str)])]) -> UsageSnapshot {
        UsageSnapshot {
            id: WorkloadId::new(ns, name),
            containers: containers
                .iter()
                .map(|(cname, usage)| ContainerUsage {
                    name: cname.to_string(),
                    usage: usage
                        .iter()
                        .map(|(k, v)| (k.to_string(), Quantity::from(*v)))
                        .collect(),
                })
                .collect(),
            timestamp: None,
            window: None,
        }
    }

    fn ids(correlation: &Correlation) -> BTreeSet<WorkloadId> {
        correlation.results.iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_cpu_half_of_limit() {
        let workloads = vec![workload("default", "a", &[("app", &[("cpu", "500m")])])];
        let usage = vec![usage("default", "a", &[("app", &[("cpu", "250m")])])];

        let correlation = correlate(&workloads, &usage);
        assert_eq!(correlation.results.len(), 1);

        let (container, cpu) = correlation.results[0].utilizations().next().unwrap();
        assert_eq!(container, "app");
        assert_eq!(cpu.resource, "cpu");
        assert_eq!(format!("{:.2}", cpu.percentage), "50.00");
        assert!(correlation.skipped.is_empty());
    }

    #[test]
    fn test_workload_without_limits_is_excluded() {
        let workloads = vec![workload("default", "b", &[("app", &[])])];
        let usage = vec![usage("default", "b", &[("app", &[("cpu", "100m")])])];

        let correlation = correlate(&workloads, &usage);
        assert!(correlation.results.is_empty());
        assert_eq!(correlation.limited_workloads, 0);
    }

    #[test]
    fn test_result_set_is_intersection() {
        let workloads = vec![
            workload("default", "limited-1", &[("app", &[("cpu", "1")])]),
            workload("default", "limited-2", &[("app", &[("memory", "1Gi")])]),
            workload("default", "unlimited", &[("app", &[])]),
            workload("default", "limited-no-usage", &[("app", &[("cpu", "1")])]),
        ];
        let usage = vec![
            usage("default", "limited-1", &[("app", &[("cpu", "100m")])]),
            usage("default", "limited-2", &[("app", &[("memory", "512Mi")])]),
            usage("default", "unlimited", &[("app", &[("cpu", "100m")])]),
            usage("default", "unknown", &[("app", &[("cpu", "100m")])]),
        ];

        let correlation = correlate(&workloads, &usage);
        let expected: BTreeSet<_> = [
            WorkloadId::new("default", "limited-1"),
            WorkloadId::new("default", "limited-2"),
        ]
        .into_iter()
        .collect();
        assert_eq!(ids(&correlation), expected);
        assert_eq!(correlation.limited_workloads, 3);
    }

    #[test]
    fn test_identity_includes_namespace() {
        let workloads = vec![workload("prod", "web", &[("app", &[("cpu", "1")])])];
        let usage = vec![
            usage("staging", "web", &[("app", &[("cpu", "500m")])]),
            usage("prod", "web", &[("app", &[("cpu", "250m")])]),
        ];

        let correlation = correlate(&workloads, &usage);
        assert_eq!(correlation.results.len(), 1);
        assert_eq!(correlation.results[0].id, WorkloadId::new("prod", "web"));
        let (_, cpu) = correlation.results[0].utilizations().next().unwrap();
        assert!((cpu.percentage - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_is_idempotent() {
        let workloads = vec![
            workload("b", "x", &[("app", &[("cpu", "2"), ("memory", "1Gi")])]),
            workload("a", "y", &[("app", &[("cpu", "1")])]),
        ];
        let usage = vec![
            usage("b", "x", &[("app", &[("cpu", "1"), ("memory", "256Mi")])]),
            usage("a", "y", &[("app", &[("cpu", "100m")])]),
        ];

        let first = correlate(&workloads, &usage);
        let second = correlate(&workloads, &usage);
        assert_eq!(first, second);
        assert_eq!(first.results[0].id, WorkloadId::new("a", "y"));
    }

    #[test]
    fn test_zero_limit_is_skipped_not_fatal() {
        let workloads = vec![workload(
            "default",
            "z",
            &[("app", &[("cpu", "0"), ("memory", "100Mi")])],
        )];
        let usage = vec![usage(
            "default",
            "z",
            &[("app", &[("cpu", "10m"), ("memory", "50Mi")])],
        )];

        let correlation = correlate(&workloads, &usage);
        assert_eq!(correlation.results.len(), 1);

        let resources: Vec<_> = correlation.results[0].utilizations().collect();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].1.resource, "memory");
        assert!((resources[0].1.percentage - 50.0).abs() < 1e-9);

        assert_eq!(correlation.skipped.len(), 1);
        assert_eq!(correlation.skipped[0].reason, EntryError::ZeroLimit);
        assert_eq!(correlation.skipped[0].resource.as_deref(), Some("cpu"));
    }

    #[test]
    fn test_every_container_is_reported() {
        let workloads = vec![workload(
            "default",
            "multi",
            &[
                ("app", &[("cpu", "1")]),
                ("sidecar", &[("cpu", "200m")]),
                ("init-like", &[]),
            ],
        )];
        let usage = vec![usage(
            "default",
            "multi",
            &[
                ("app", &[("cpu", "500m")]),
                ("sidecar", &[("cpu", "50m")]),
                ("init-like", &[("cpu", "1m")]),
            ],
        )];

        let correlation = correlate(&workloads, &usage);
        let result = &correlation.results[0];
        assert_eq!(result.containers.len(), 2);
        assert_eq!(result.containers[0].container, "app");
        assert!((result.containers[0].resources[0].percentage - 50.0).abs() < 1e-9);
        assert_eq!(result.containers[1].container, "sidecar");
        assert!((result.containers[1].resources[0].percentage - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_usage_and_limit_are_recorded() {
        let workloads = vec![workload(
            "default",
            "partial",
            &[("app", &[("cpu", "1")]), ("worker", &[("cpu", "1")])],
        )];
        let usage = vec![usage(
            "default",
            "partial",
            &[("app", &[("cpu", "100m"), ("memory", "10Mi")])],
        )];

        let correlation = correlate(&workloads, &usage);
        assert_eq!(correlation.results.len(), 1);

        let reasons: Vec<_> = correlation.skipped.iter().map(|s| s.reason.clone()).collect();
        assert!(reasons.contains(&EntryError::MissingLimit));
        assert!(reasons.contains(&EntryError::MissingUsage));
    }

    #[test]
    fn test_bad_quantities() {
        assert!(matches!(
            utilization("cpu", &Quantity::from("1"), &Quantity::from("lots")),
            Err(EntryError::Quantity(_))
        ));
        assert!(matches!(
            utilization("cpu", &Quantity::from("1"), &Quantity::from("-1")),
            Err(EntryError::InvalidLimit(_))
        ));
        assert_eq!(
            utilization("cpu", &Quantity::from("1"), &Quantity::from("0m")),
            Err(EntryError::ZeroLimit)
        );
    }

    #[test]
    fn test_bad_usage_is_skipped() {
        assert!(matches!(
            utilization("cpu", &Quantity::from("1e400"), &Quantity::from("1")),
            Err(EntryError::InvalidUsage(_))
        ));
        assert_eq!(
            utilization("cpu", &Quantity::from("-5"), &Quantity::from("1")),
            Err(EntryError::InvalidUsage(-5.0))
        );
        assert!(matches!(
            utilization("cpu", &Quantity::from("1e300"), &Quantity::from("1e-300")),
            Err(EntryError::NonFinitePercentage { .. })
        ));
    }

    #[test]
    fn test_bad_usage_does_not_reach_results() {
        let workloads = vec![workload("default", "web", &[("app", &[("cpu", "1"), ("memory", "1Gi")])])];
        let snapshots = vec![usage("default", "web", &[("app", &[("cpu", "-5"), ("memory", "512Mi")])])];

        let correlation = correlate(&workloads, &snapshots);

        let percentages: Vec<f64> = correlation.results[0]
            .utilizations()
            .map(|(_, u)| u.percentage)
            .collect();
        assert_eq!(percentages.len(), 1);
        assert!(percentages.iter().all(|p| p.is_finite() && *p >= 0.0));
        assert_eq!(correlation.skipped.len(), 1);
        assert_eq!(correlation.skipped[0].resource.as_deref(), Some("cpu"));
        assert_eq!(correlation.skipped[0].reason, EntryError::InvalidUsage(-5.0));
    }

    #[test]
    fn test_memory_percentage() {
        let u = utilization("memory", &Quantity::from("64Mi"), &Quantity::from("256Mi")).unwrap();
        assert!((u.percentage - 25.0).abs() < 1e-9);
    }
}
