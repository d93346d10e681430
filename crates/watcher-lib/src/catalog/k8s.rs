//! Kubernetes-backed list sources
//!
//! Pods come from the core/v1 API. The metrics API has no typed client in
//! k8s-openapi, so PodMetrics are listed with a raw request and
//! deserialized into local types.

use super::ListSource;
use crate::error::CatalogError;
use crate::models::{ContainerLimits, ContainerUsage, ResourceList, UsageSnapshot, Workload, WorkloadId};
use crate::quantity::Quantity;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Namespace excluded from both catalogs unless configured otherwise
pub const DEFAULT_EXCLUDED_NAMESPACE: &str = "kube-system";

const POD_METRICS_PATH: &str = "/apis/metrics.k8s.io/v1beta1/pods";

/// Field selector listing every namespace except `excluded`
pub fn namespace_field_selector(excluded: &str) -> String {
    format!("metadata.namespace!={}", excluded)
}

/// Lists pods across all namespaces except the excluded one
pub struct PodSource {
    api: Api<Pod>,
    field_selector: String,
}

impl PodSource {
    pub fn new(client: Client, excluded_namespace: &str) -> Self {
        Self {
            api: Api::all(client),
            field_selector: namespace_field_selector(excluded_namespace),
        }
    }
}

#[async_trait]
impl ListSource for PodSource {
    type Item = Workload;

    fn name(&self) -> &'static str {
        "pods"
    }

    async fn fetch(&self) -> Result<Vec<Workload>, CatalogError> {
        let params = ListParams::default().fields(&self.field_selector);
        let pods = self
            .api
            .list(&params)
            .await
            .map_err(|source| CatalogError::Api {
                catalog: self.name(),
                source,
            })?;

        Ok(pods.items.iter().map(pod_to_workload).collect())
    }
}

/// Convert a pod into a workload, keeping only container limits
pub fn pod_to_workload(pod: &Pod) -> Workload {
    let containers = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|container| ContainerLimits {
                    name: container.name.clone(),
                    limits: container
                        .resources
                        .as_ref()
                        .and_then(|r| r.limits.as_ref())
                        .map(|limits| {
                            limits
                                .iter()
                                .map(|(k, v)| (k.clone(), Quantity(v.0.clone())))
                                .collect::<ResourceList>()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    Workload {
        id: WorkloadId::new(pod.namespace().unwrap_or_default(), pod.name_any()),
        containers,
    }
}

/// metrics.k8s.io/v1beta1 PodMetrics
#[derive(Debug, Clone, Deserialize)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub containers: Vec<PodMetricsContainer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodMetricsContainer {
    pub name: String,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PodMetricsList {
    #[serde(default)]
    pub items: Vec<PodMetrics>,
}

/// Lists pod usage from the metrics API
pub struct PodMetricsSource {
    client: Client,
    field_selector: String,
}

impl PodMetricsSource {
    pub fn new(client: Client, excluded_namespace: &str) -> Self {
        Self {
            client,
            field_selector: namespace_field_selector(excluded_namespace),
        }
    }
}

#[async_trait]
impl ListSource for PodMetricsSource {
    type Item = UsageSnapshot;

    fn name(&self) -> &'static str {
        "pod metrics"
    }

    async fn fetch(&self) -> Result<Vec<UsageSnapshot>, CatalogError> {
        let params = ListParams::default().fields(&self.field_selector);
        let request = kube::core::Request::new(POD_METRICS_PATH)
            .list(&params)
            .map_err(|e| CatalogError::Api {
                catalog: self.name(),
                source: kube::Error::BuildRequest(e),
            })?;

        let list: PodMetricsList =
            self.client
                .request(request)
                .await
                .map_err(|source| CatalogError::Api {
                    catalog: self.name(),
                    source,
                })?;

        Ok(list.items.iter().map(pod_metrics_to_usage).collect())
    }
}

/// Convert a PodMetrics object into a usage snapshot
pub fn pod_metrics_to_usage(metrics: &PodMetrics) -> UsageSnapshot {
    UsageSnapshot {
        id: WorkloadId::new(
            metrics.metadata.namespace.clone().unwrap_or_default(),
            metrics.metadata.name.clone().unwrap_or_default(),
        ),
        containers: metrics
            .containers
            .iter()
            .map(|c| ContainerUsage {
                name: c.name.clone(),
                usage: c.usage.clone(),
            })
            .collect(),
        timestamp: metrics.timestamp.clone(),
        window: metrics.window.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_selector() {
        assert_eq!(
            namespace_field_selector(DEFAULT_EXCLUDED_NAMESPACE),
            "metadata.namespace!=kube-system"
        );
    }

    #[test]
    fn test_pod_to_workload_keeps_limits_per_container() {
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web-0", "namespace": "shop" },
            "spec": {
                "containers": [
                    {
                        "name": "app",
                        "resources": {
                            "limits": { "cpu": "500m", "memory": "256Mi" },
                            "requests": { "cpu": "100m" }
                        }
                    },
                    { "name": "sidecar" }
                ]
            }
        }))
        .unwrap();

        let workload = pod_to_workload(&pod);
        assert_eq!(workload.id, WorkloadId::new("shop", "web-0"));
        assert_eq!(workload.containers.len(), 2);
        assert_eq!(workload.containers[0].limits["cpu"], Quantity::from("500m"));
        assert_eq!(workload.containers[0].limits["memory"], Quantity::from("256Mi"));
        assert!(workload.containers[1].limits.is_empty());
        assert!(workload.has_limits());
    }

    #[test]
    fn test_pod_without_spec_has_no_containers() {
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "bare", "namespace": "default" }
        }))
        .unwrap();

        let workload = pod_to_workload(&pod);
        assert!(workload.containers.is_empty());
        assert!(!workload.has_limits());
    }

    #[test]
    fn test_pod_metrics_list_deserialization() {
        let list: PodMetricsList = serde_json::from_value(json!({
            "kind": "PodMetricsList",
            "apiVersion": "metrics.k8s.io/v1beta1",
            "metadata": {},
            "items": [
                {
                    "metadata": { "name": "web-0", "namespace": "shop" },
                    "timestamp": "2024-01-01T00:00:00Z",
                    "window": "30s",
                    "containers": [
                        { "name": "app", "usage": { "cpu": "250m", "memory": "128Mi" } }
                    ]
                }
            ]
        }))
        .unwrap();

        assert_eq!(list.items.len(), 1);
        let usage = pod_metrics_to_usage(&list.items[0]);
        assert_eq!(usage.id, WorkloadId::new("shop", "web-0"));
        assert_eq!(usage.window.as_deref(), Some("30s"));
        assert_eq!(usage.containers[0].name, "app");
        assert_eq!(usage.containers[0].usage["cpu"], Quantity::from("250m"));
    }
}
