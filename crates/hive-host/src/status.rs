//! Status sink backed by structured logging.
//!
//! The external reconciler consumes status records through this sink; in
//! this deployment they are emitted as `tracing` events for the
//! co-located reconciler sidecar to scrape.

use tracing::info;

use hive_core::control::{ModuleStatus, StatusSink};

/// Reports module status as structured log events.
#[derive(Debug, Default)]
pub struct TracingStatusSink;

impl TracingStatusSink {
    /// Create a sink.
    pub fn new() -> Self {
        Self
    }
}

impl StatusSink for TracingStatusSink {
    fn report(&self, status: ModuleStatus) {
        info!(
            module = %status.module,
            state = %status.state,
            tier = status.tier.map(|t| t.to_string()),
            runner = status.runner.as_ref().map(ToString::to_string),
            ready = status.ready,
            last_error = status.last_error,
            "Module status"
        );
    }
}
