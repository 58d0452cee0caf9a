//! Shared gateway state.

use std::sync::Arc;

use ubl_core::UblRuntime;

use crate::metrics::GatewayMetrics;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// The coordinator runtime.
    pub runtime: Arc<UblRuntime>,
    /// Prometheus metrics.
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    /// Builds state over a runtime with a fresh metrics registry.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails, which only happens on duplicate
    /// registration within one registry and is a programming error.
    #[must_use]
    pub fn new(runtime: Arc<UblRuntime>) -> Self {
        Self {
            runtime,
            metrics: Arc::new(GatewayMetrics::new().expect("metrics registration")),
        }
    }
}
