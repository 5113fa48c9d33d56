//! `OpenTelemetry` export and check-in counters (`metrics` feature only).

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the trace and meter providers alive. Dropping it does not flush;
/// call [`MetricsGuard::shutdown`] before exit.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    pub const fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Install global trace and meter providers exporting over OTLP/gRPC to
/// `endpoint`, tagged with `service_name`.
pub fn init_metrics(endpoint: &str, service_name: &str) -> Result<MetricsGuard, MetricsError> {
    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(spans)
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_periodic_exporter(metrics)
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Counters for check-in resolutions.
///
/// Built from the global meter, so they are no-ops until [`init_metrics`]
/// installs a provider.
pub struct CheckInMetrics {
    escalations: Counter<u64>,
    acknowledgements: Counter<u64>,
    delivery_failures: Counter<u64>,
}

impl CheckInMetrics {
    pub fn new() -> Self {
        let meter = global::meter("lifeline");
        Self {
            escalations: meter
                .u64_counter("lifeline.checkins.escalated")
                .with_description("Check-ins transitioned to escalated or missed")
                .build(),
            acknowledgements: meter
                .u64_counter("lifeline.checkins.acknowledged")
                .with_description("Check-ins acknowledged with a correct code")
                .build(),
            delivery_failures: meter
                .u64_counter("lifeline.deliveries.failed")
                .with_description("Contact notifications that failed to deliver")
                .build(),
        }
    }

    pub fn record_escalation(&self, outcome: &'static str) {
        self.escalations.add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn record_acknowledgement(&self) {
        self.acknowledgements.add(1, &[]);
    }

    pub fn record_delivery_failures(&self, count: u64, channel: &'static str) {
        if count > 0 {
            self.delivery_failures
                .add(count, &[KeyValue::new("channel", channel)]);
        }
    }
}

impl Default for CheckInMetrics {
    fn default() -> Self {
        Self::new()
    }
}
