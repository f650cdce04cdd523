//! Telemetry for workdispatch processes.
//!
//! Logs always go to a local fmt layer. When an OTLP endpoint is configured,
//! spans, metrics and logs are also exported, all tagged with a resource that
//! says which worker produced them: service name, a per-process instance id
//! and the categories the worker polls. Several processors on the same
//! categories can then be told apart in one backend.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::error::{Error, Result};

/// Resource attribute listing the categories a worker polls, in priority
/// order, comma separated.
pub const CATEGORIES_ATTRIBUTE: &str = "workdispatch.categories";

/// How a process identifies itself in telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint (e.g. "http://localhost:4317"). Without one only
    /// the fmt layer is installed.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset (e.g. "info", "workdispatch=debug").
    pub default_level: String,
    /// Distinguishes this process from other workers of the same service.
    /// A random id is used when unset.
    pub instance_id: Option<String>,
    /// Categories this process polls. Empty for one-shot commands.
    pub categories: Vec<String>,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            default_level: "info".to_string(),
            instance_id: None,
            categories: Vec::new(),
        }
    }

    /// Attributes every exported signal carries, besides the service name.
    pub fn resource_attributes(&self) -> Vec<KeyValue> {
        let instance = self
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut attributes = vec![KeyValue::new("service.instance.id", instance)];
        if !self.categories.is_empty() {
            attributes.push(KeyValue::new(
                CATEGORIES_ATTRIBUTE,
                self.categories.join(","),
            ));
        }
        attributes
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(self.resource_attributes())
            .build()
    }
}

/// The three OTLP providers, kept so they can be flushed and shut down.
struct Pipelines {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

/// Flushes and shuts down exporters on drop. Hold it for the life of the
/// process.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    /// Whether signals are being exported over OTLP.
    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }

    /// Push out anything buffered, e.g. before a drained worker exits.
    pub fn force_flush(&self) {
        if let Some(ref p) = self.pipelines {
            let _ = p.tracer.force_flush();
            let _ = p.meter.force_flush();
            let _ = p.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first so shutdown-time log records still reach the exporter.
        if let Some(p) = self.pipelines.take() {
            let _ = p.logger.shutdown();
            let _ = p.meter.shutdown();
            let _ = p.tracer.shutdown();
        }
    }
}

/// Install the global tracing subscriber and, with an endpoint, the OTLP
/// pipelines and global meter provider.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a subscriber is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str()));

    let Some(ref endpoint) = config.endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { pipelines: None });
    };

    let pipelines = build_pipelines(endpoint, config.resource())?;
    opentelemetry::global::set_meter_provider(pipelines.meter.clone());

    let tracer = pipelines.tracer.tracer("workdispatch");
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &pipelines.logger,
        ))
        .try_init()
        .map_err(subscriber_error)?;

    tracing::info!(
        endpoint = %endpoint,
        service = %config.service_name,
        categories = ?config.categories,
        "exporting telemetry"
    );
    Ok(TelemetryGuard {
        pipelines: Some(pipelines),
    })
}

fn build_pipelines(endpoint: &str, resource: Resource) -> Result<Pipelines> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metrics)
        .with_resource(resource.clone())
        .build();

    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();

    Ok(Pipelines {
        tracer,
        meter,
        logger,
    })
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a KeyValue> {
        attributes.iter().find(|kv| kv.key.as_str() == key)
    }

    #[test]
    fn worker_resource_names_instance_and_categories() {
        let config = TelemetryConfig {
            instance_id: Some("billing-1".to_string()),
            categories: vec!["urgent".to_string(), "billing".to_string()],
            ..TelemetryConfig::new("workdispatch")
        };
        let attributes = config.resource_attributes();

        let instance = attribute(&attributes, "service.instance.id").unwrap();
        assert_eq!(instance.value.as_str(), "billing-1");
        let categories = attribute(&attributes, CATEGORIES_ATTRIBUTE).unwrap();
        assert_eq!(categories.value.as_str(), "urgent,billing");
    }

    #[test]
    fn one_shot_resource_omits_categories() {
        let attributes = TelemetryConfig::new("workdispatch").resource_attributes();
        assert!(attribute(&attributes, "service.instance.id").is_some());
        assert!(attribute(&attributes, CATEGORIES_ATTRIBUTE).is_none());
    }
}
