//! API shared state containing actor handles

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::actors::reload::ReloadHandle;
use crate::query::MetricsSource;
use crate::telemetry::ProcessCollector;

/// Default bound of the readiness probe query
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Reload listener handle
    pub reload: ReloadHandle,

    /// Backend probed by the readiness endpoint
    pub source: Arc<dyn MetricsSource>,

    /// Renders the `/metrics` exposition
    pub metrics: PrometheusHandle,

    /// Refreshes the process gauges before each scrape
    pub process: Option<Arc<ProcessCollector>>,

    pub ready_timeout: Duration,
}

impl ApiState {
    pub fn new(reload: ReloadHandle, source: Arc<dyn MetricsSource>, metrics: PrometheusHandle) -> Self {
        Self {
            reload,
            source,
            metrics,
            process: ProcessCollector::new().map(Arc::new),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }
}
