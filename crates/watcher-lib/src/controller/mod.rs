//! Reconcile loop
//!
//! This module provides:
//! - The synchronization step correlating workloads with usage
//! - The controller driving it from the work queue, gated on cache sync
//! - Error observation for failed passes

mod r#loop;
mod reconciler;


pub use r#loop::{Controller, ControllerBuilder, ControllerConfig};
pub use reconciler::{Reconciler, SyncReport};

use crate::error::ReconcileError;
use std::fmt;
use tracing::error;

/// Lifecycle of the reconcile loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the workload cache to be populated
    WaitingForSync,
    /// Workers are draining the queue
    Running,
    /// Stop requested; in-flight work finishing
    Draining,
    /// All workers exited
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::WaitingForSync => "waiting_for_sync",
            LoopState::Running => "running",
            LoopState::Draining => "draining",
            LoopState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Receives failures of the synchronization step
pub trait ErrorObserver: Send + Sync {
    fn observe(&self, error: &ReconcileError);
}

/// Logs failures through tracing
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorObserver;

impl ErrorObserver for LoggingErrorObserver {
    fn observe(&self, err: &ReconcileError) {
        error!(error = %err, "Sync failed");
    }
}
