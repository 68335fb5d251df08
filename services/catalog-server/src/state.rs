//! Application state shared across request handlers.

use std::sync::Arc;

use crate::health::HealthAggregator;
use crate::report::ServiceInfo;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    health: Arc<HealthAggregator>,
    service: ServiceInfo,
}

impl AppState {
    /// Create a new application state.
    pub fn new(health: Arc<HealthAggregator>, service: ServiceInfo) -> Self {
        Self {
            inner: Arc::new(AppStateInner { health, service }),
        }
    }

    /// Get a handle to the health aggregator.
    pub fn health(&self) -> Arc<HealthAggregator> {
        Arc::clone(&self.inner.health)
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.inner.service
    }
}
