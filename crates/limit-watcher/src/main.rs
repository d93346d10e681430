//! Limit Watcher - container usage against declared limits
//!
//! Watches pods across the cluster and, whenever they change, reports how
//! much of each container's declared limits is currently in use.

use anyhow::{bail, Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use limit_watcher::{api, config::WatcherConfig};
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watcher_lib::{
    catalog::{PodCatalog, PodMetricsCatalog, PodMetricsSource, PodSource},
    controller::{ControllerBuilder, Reconciler},
    error::ControllerError,
    events::{EventLoopExit, PodEventSource, QueueEventHandler},
    health::{components, HealthRegistry},
    observability::{StructuredLogger, WatcherMetrics},
    queue::WorkQueue,
    sink::{LogSink, MetricsSink},
};

const WATCHER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting limit-watcher");

    let config = WatcherConfig::load()?;
    info!(
        kubeconfig = %config.kubeconfig.display(),
        workers = config.workers,
        excluded_namespace = %config.excluded_namespace,
        "Watcher configured"
    );

    let kubeconfig = Kubeconfig::read_from(&config.kubeconfig)
        .with_context(|| format!("Failed to read {}", config.kubeconfig.display()))?;
    let cluster = kubeconfig
        .current_context
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let client_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("Invalid kubeconfig")?;
    let client = Client::try_from(client_config).context("Failed to create Kubernetes client")?;

    let health_registry = HealthRegistry::new(config.unhealthy_after_failures);
    health_registry.register(components::EVENT_SOURCE).await;
    health_registry.register(components::RECONCILER).await;

    let registry = Registry::new();
    let metrics = WatcherMetrics::new(&registry).context("Failed to register metrics")?;

    let logger = StructuredLogger::new(cluster);
    logger.log_startup(WATCHER_VERSION, config.workers);

    let queue = WorkQueue::new("limits", &config.backoff_config());
    let resources = Arc::new(PodCatalog::new(PodSource::new(
        client.clone(),
        &config.excluded_namespace,
    )));
    let usage = Arc::new(PodMetricsCatalog::new(PodMetricsSource::new(
        client.clone(),
        &config.excluded_namespace,
    )));
    let reconciler = Reconciler::new(resources, usage)
        .with_sink(Arc::new(LogSink))
        .with_sink(Arc::new(MetricsSink::new(metrics.clone())));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let handler = QueueEventHandler::new(queue.clone()).with_metrics(metrics.clone());
    let (synced, mut events_handle) = PodEventSource::new(client, &config.excluded_namespace)
        .with_resync_period(config.resync_period())
        .with_health(health_registry.clone())
        .spawn(Arc::new(handler), shutdown_tx.subscribe());

    let controller = ControllerBuilder::new()
        .queue(queue)
        .reconciler(Arc::new(reconciler))
        .config(config.controller_config())
        .health(health_registry.clone())
        .metrics(metrics)
        .logger(logger.clone())
        .build()?;
    let mut controller_handle = tokio::spawn(controller.run(synced, shutdown_tx.subscribe()));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry, registry));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let stop = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
            Stop::Signal
        }
        finished = &mut controller_handle => {
            Stop::Controller(finished.context("Controller task panicked")?)
        }
        exit = &mut events_handle => {
            let reason = match exit {
                Ok(EventLoopExit::StreamEnded) => "workload watch stream ended".to_string(),
                Ok(EventLoopExit::Shutdown) => "event source stopped".to_string(),
                Err(e) => format!("event source task failed: {}", e),
            };
            error!(reason = %reason, "Event source stopped unexpectedly");
            Stop::EventSource(reason)
        }
        served = &mut api_handle => {
            let reason = match served {
                Ok(Ok(())) => "API server exited".to_string(),
                Ok(Err(e)) => format!("API server failed: {:#}", e),
                Err(e) => format!("API server task failed: {}", e),
            };
            error!(reason = %reason, "API server stopped unexpectedly");
            Stop::ApiServer(reason)
        }
    };

    let _ = shutdown_tx.send(());

    // A handle that already resolved in the select must not be awaited again
    let events_done = matches!(stop, Stop::EventSource(_));
    let api_done = matches!(stop, Stop::ApiServer(_));
    let (outcome, failure) = match stop {
        Stop::Controller(outcome) => (outcome, None),
        Stop::Signal => (controller_handle.await.context("Controller task panicked")?, None),
        Stop::EventSource(reason) | Stop::ApiServer(reason) => {
            logger.log_shutdown(&reason);
            let outcome = controller_handle.await.context("Controller task panicked")?;
            (outcome, Some(reason))
        }
    };
    if !events_done {
        if let Err(e) = events_handle.await {
            error!(error = %e, "Event source terminated abnormally");
        }
    }
    if !api_done {
        api_handle.abort();
    }

    outcome.context("Controller failed")?;
    if let Some(reason) = failure {
        bail!(reason);
    }
    info!("Shutdown complete");
    Ok(())
}

/// What ended the main wait
enum Stop {
    Signal,
    Controller(Result<(), ControllerError>),
    EventSource(String),
    ApiServer(String),
}
