// Telemetry
//
// Log/trace subscriber setup for task manager nodes, plus W3C trace context
// propagation so a task run is traced as a child of the request that
// scheduled it.

use std::collections::HashMap;
use std::time::Duration;

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider, Tracer};
use opentelemetry_sdk::Resource;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const TRACEPARENT: &str = "traceparent";
const DEFAULT_LOG_FILTER: &str = "info";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for logging and OpenTelemetry export
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    /// Node id, exported as `service.instance.id`
    pub instance_id: Option<String>,
    /// OTLP endpoint (e.g., "http://localhost:4317"); export is off when unset
    pub otlp_endpoint: Option<String>,
    pub environment: Option<String>,
    pub enable_console: bool,
    /// Log filter (e.g., "info", "everruns_task_manager=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "everruns-task-manager".to_string(),
            service_version: None,
            instance_id: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "everruns-task-manager")
    /// - `OTEL_SERVICE_VERSION`: Service version
    /// - `TASK_MANAGER_NODE_ID`: Instance id of this node
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
    /// - `OTEL_ENVIRONMENT`: Deployment environment
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: std::env::var("OTEL_SERVICE_VERSION").ok(),
            instance_id: std::env::var("TASK_MANAGER_NODE_ID").ok(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            environment: std::env::var("OTEL_ENVIRONMENT").ok(),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ..defaults
        }
    }

    fn resource(&self) -> Resource {
        let optional = [
            ("service.version", &self.service_version),
            ("service.instance.id", &self.instance_id),
            ("deployment.environment", &self.environment),
        ];
        let attributes = std::iter::once(KeyValue::new("service.name", self.service_name.clone()))
            .chain(optional.into_iter().filter_map(|(key, value)| {
                value.as_ref().map(|value| KeyValue::new(key, value.clone()))
            }));
        Resource::builder().with_attributes(attributes).build()
    }

    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_deref()
            .and_then(|filter| EnvFilter::try_new(filter).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP span exporter: {0}")]
    Exporter(String),
}

/// Flushes and shuts down the tracer provider when dropped
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are exported over OTLP
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shut down tracer provider: {e:?}");
            }
        }
    }
}

/// Install the global subscriber
///
/// An unusable OTLP endpoint is logged and the node keeps running with
/// console logs only. Keep the returned guard alive for the lifetime of the
/// process.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let console = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(config.env_filter())
    });

    let exporter = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| (endpoint, otlp_tracer(endpoint, config.resource())));
    let (provider, otel) = match &exporter {
        Some((_, Ok((provider, tracer)))) => (
            Some(provider.clone()),
            Some(tracing_opentelemetry::layer().with_tracer(tracer.clone())),
        ),
        _ => (None, None),
    };

    tracing_subscriber::registry().with(console).with(otel).init();

    match exporter {
        Some((endpoint, Ok(_))) => tracing::info!(endpoint, "exporting task manager traces"),
        Some((endpoint, Err(err))) => {
            tracing::warn!(endpoint, error = %err, "OTLP export disabled")
        }
        None => tracing::debug!("OTLP export disabled, OTEL_EXPORTER_OTLP_ENDPOINT not set"),
    }

    TelemetryGuard { provider }
}

fn otlp_tracer(
    endpoint: &str,
    resource: Resource,
) -> Result<(SdkTracerProvider, Tracer), TelemetryError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();
    let tracer = provider.tracer("everruns-task-manager");
    Ok((provider, tracer))
}

/// W3C `traceparent` of the current span, if it is part of a trace
pub fn current_traceparent() -> Option<String> {
    let context = tracing::Span::current().context();
    let mut carrier: HashMap<String, String> = HashMap::new();
    TraceContextPropagator::new().inject_context(&context, &mut carrier);
    carrier.remove(TRACEPARENT)
}

/// Parent `span` to the trace identified by a stored `traceparent`
pub fn set_parent_from_traceparent(span: &tracing::Span, traceparent: Option<&str>) {
    let Some(traceparent) = traceparent else {
        return;
    };
    let carrier = HashMap::from([(TRACEPARENT.to_string(), traceparent.to_string())]);
    let context = TraceContextPropagator::new().extract(&carrier);
    let _ = span.set_parent(context);
}
