//! Shared tracing/logging initialization.
//!
//! The server binary and device-side embedders use the same pattern for
//! setting up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"lifeline_server=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Opaque guard returned by [`init_tracing_with_metrics`].
///
/// Without the `metrics` feature this is an empty value.
#[cfg(feature = "metrics")]
pub type TelemetryGuard = Option<crate::metrics::MetricsGuard>;
#[cfg(not(feature = "metrics"))]
pub type TelemetryGuard = ();

/// Initialise tracing and, when the `metrics` feature is enabled and an
/// endpoint is given, the OTLP pipeline for traces and metrics.
///
/// A failing OTLP exporter is logged and the process continues with plain
/// logging.
#[cfg(feature = "metrics")]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
    service_name: &str,
) -> TelemetryGuard {
    let Some(endpoint) = metrics_endpoint else {
        init_tracing(default_filter, log_json);
        return None;
    };

    use opentelemetry::trace::TracerProvider as _;

    match crate::metrics::init_metrics(endpoint, service_name) {
        Ok(guard) => {
            let env_filter = tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
            );
            let tracer = guard.tracer_provider().tracer(service_name.to_string());
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            if log_json {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(otel_layer)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(otel_layer)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            }
            tracing::info!(endpoint, "OpenTelemetry export enabled");
            Some(guard)
        }
        Err(e) => {
            init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, endpoint, "Failed to initialise OpenTelemetry, continuing without it");
            None
        }
    }
}

/// Initialise tracing. The metrics endpoint is ignored because the `metrics`
/// feature is disabled.
#[cfg(not(feature = "metrics"))]
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    metrics_endpoint: Option<&str>,
    _service_name: &str,
) -> TelemetryGuard {
    init_tracing(default_filter, log_json);
    if metrics_endpoint.is_some() {
        tracing::warn!("Metrics endpoint given but the `metrics` feature is not compiled in");
    }
}
