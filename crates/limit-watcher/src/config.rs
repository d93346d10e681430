//! Watcher configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use watcher_lib::catalog::DEFAULT_EXCLUDED_NAMESPACE;
use watcher_lib::controller::ControllerConfig;
use watcher_lib::queue::BackoffConfig;

/// Watcher configuration, read from `WATCHER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Kubeconfig used to reach the cluster, from `KUBECONFIG`
    #[serde(skip)]
    pub kubeconfig: PathBuf,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Namespace ignored by both catalogs and the event source
    #[serde(default = "default_excluded_namespace")]
    pub excluded_namespace: String,

    /// Seconds between full re-deliveries of watched pods; 0 disables
    #[serde(default = "default_resync_period")]
    pub resync_period_secs: u64,

    #[serde(default = "default_cache_sync_timeout")]
    pub cache_sync_timeout_secs: u64,

    /// Deadline for one reconciliation pass
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// Initial per-key retry delay
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Overall retry rate across keys
    #[serde(default = "default_rate_limit_qps")]
    pub rate_limit_qps: f64,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Consecutive failures before a component reports unhealthy
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after_failures: u32,
}

fn default_api_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    1
}

fn default_excluded_namespace() -> String {
    DEFAULT_EXCLUDED_NAMESPACE.to_string()
}

fn default_resync_period() -> u64 {
    120
}

fn default_cache_sync_timeout() -> u64 {
    300
}

fn default_sync_timeout() -> u64 {
    30
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    1000
}

fn default_rate_limit_qps() -> f64 {
    10.0
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_unhealthy_after() -> u32 {
    5
}

impl WatcherConfig {
    /// Load configuration from the environment.
    ///
    /// Fails when `KUBECONFIG` is unset or empty.
    pub fn load() -> Result<Self> {
        let kubeconfig = std::env::var_os("KUBECONFIG")
            .filter(|path| !path.is_empty())
            .context("KUBECONFIG must point to a kubeconfig file")?;

        Self::from_env(
            config::Environment::with_prefix("WATCHER"),
            PathBuf::from(kubeconfig),
        )
    }

    /// Build from an explicit environment source
    pub fn from_env(env: config::Environment, kubeconfig: PathBuf) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .context("Failed to read configuration")?;

        let mut config: WatcherConfig = settings
            .try_deserialize()
            .context("Invalid WATCHER_* configuration")?;
        config.kubeconfig = kubeconfig;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.rate_limit_qps.is_finite() || self.rate_limit_qps <= 0.0 {
            bail!(
                "WATCHER_RATE_LIMIT_QPS must be a positive number, got {}",
                self.rate_limit_qps
            );
        }
        if self.backoff_base_ms == 0 {
            bail!("WATCHER_BACKOFF_BASE_MS must be greater than zero");
        }
        Ok(())
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            qps: self.rate_limit_qps,
            burst: self.rate_limit_burst,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
        }
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}
