//! Observability infrastructure: tracing, metrics, health checks.

use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TraceError;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, Tracer};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod health;
pub mod metrics;

/// Subsystem names tracked by the daemon's [`health::HealthChecker`].
pub const SUBSYSTEM_HYPERVISOR: &str = "hypervisor";
pub const SUBSYSTEM_TRANSPORT: &str = "transport";
pub const SUBSYSTEM_SCHEDULER: &str = "scheduler";
pub const SUBSYSTEM_STATS: &str = "stats";

/// Initialize the global observability infrastructure.
///
/// Call once at startup. `log_level` is the default filter when `RUST_LOG`
/// is unset; `metrics_port` enables the Prometheus listener and
/// `otlp_endpoint` the trace exporter.
pub fn init(
    log_level: &str,
    metrics_port: Option<u16>,
    otlp_endpoint: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let telemetry = match otlp_endpoint {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .with(telemetry)
        .init();
    match otlp_endpoint {
        Some(endpoint) => tracing::info!(endpoint, "Observability initialized with OTLP tracing"),
        None => tracing::info!("Observability initialized"),
    }

    if let Some(port) = metrics_port {
        PrometheusBuilder::new().with_http_listener(([0, 0, 0, 0], port)).install()?;
        tracing::info!(port, "Prometheus exporter listening");
    }

    metrics::register_core_metrics();

    Ok(())
}

fn otlp_tracer(endpoint: &str) -> Result<Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "qvmd"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
}

/// Shutdown observability infrastructure gracefully.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
