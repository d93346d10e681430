//! Health check infrastructure for the limit watcher
//!
//! Tracks the health of the event source and the reconciler for
//! Kubernetes liveness and readiness probes. Readiness follows the cache
//! sync barrier: the watcher is not ready until the workload cache has
//! been populated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Failing, but still retrying
    Degraded,
    Unhealthy,
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_timestamp: Option<i64>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            last_success_timestamp: None,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const EVENT_SOURCE: &str = "event_source";
    pub const RECONCILER: &str = "reconciler";
}

/// Default number of consecutive failures before a component is unhealthy
pub const DEFAULT_UNHEALTHY_AFTER: u32 = 5;

/// Health registry shared by the controller and the HTTP probes
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    synced: Arc<RwLock<bool>>,
    unhealthy_after: u32,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_UNHEALTHY_AFTER)
    }
}

impl HealthRegistry {
    pub fn new(unhealthy_after: u32) -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            synced: Arc::new(RwLock::new(false)),
            unhealthy_after: unhealthy_after.max(1),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::new);
    }

    /// Record a successful operation, resetting the failure streak
    pub async fn record_success(&self, name: &str) {
        let now = chrono::Utc::now().timestamp();
        let mut components = self.components.write().await;
        let health = components
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::new);
        health.status = ComponentStatus::Healthy;
        health.message = None;
        health.consecutive_failures = 0;
        health.last_success_timestamp = Some(now);
        health.last_check_timestamp = now;
    }

    /// Record a failed operation.
    ///
    /// The component degrades on the first failure and becomes unhealthy
    /// once the streak reaches the configured threshold.
    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let health = components
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::new);
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.status = if health.consecutive_failures >= self.unhealthy_after {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        health.message = Some(message.into());
        health.last_check_timestamp = chrono::Utc::now().timestamp();
    }

    /// Mark a component unhealthy regardless of its failure streak
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let health = components
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::new);
        health.status = ComponentStatus::Unhealthy;
        health.consecutive_failures = health.consecutive_failures.max(self.unhealthy_after);
        health.message = Some(message.into());
        health.last_check_timestamp = chrono::Utc::now().timestamp();
    }

    /// Record whether the workload cache has synced
    pub async fn set_synced(&self, synced: bool) {
        *self.synced.write().await = synced;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let synced = *self.synced.read().await;
        let health = self.health().await;

        if !synced {
            ReadinessResponse {
                ready: false,
                reason: Some("Waiting for workload cache to sync".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}
