//! Process-wide logging and metrics setup.
//!
//! Components never reach for a global logger: each one is handed a span from
//! [`component_span`] when it is constructed and logs inside it.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::Span;
use tracing_subscriber::{fmt, EnvFilter};

static SUBSCRIBER: OnceLock<()> = OnceLock::new();
static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Installs the fmt subscriber. Later calls are no-ops.
pub fn init() {
    SUBSCRIBER.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // a host (e.g. a test harness) may already own the global subscriber
        let _ = fmt().with_env_filter(filter).try_init();
    });
}

/// Installs the Prometheus recorder on first call and returns its render handle.
pub fn metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "prometheus recorder not installed");
                None
            }
        })
        .clone()
}

pub fn component_span(component: &'static str) -> Span {
    tracing::info_span!("oracle", component)
}
