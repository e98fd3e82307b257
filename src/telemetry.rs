//! Tracing subscriber setup
//!
//! Logs go to stderr as text or JSON, filtered by `RUST_LOG` (default
//! `info`). Spans are additionally exported over OTLP when an endpoint is
//! configured, normally through `OTEL_EXPORTER_OTLP_ENDPOINT`.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    /// OTLP gRPC endpoint, e.g. `http://otel-collector:4317`
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "alb-ingress-controller".to_string(),
            log_format: LogFormat::default(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

fn otlp_tracer(endpoint: &str, service_name: &str) -> Result<trace::Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::TelemetryError(format!("failed to initialize tracer: {e}")))
}

/// Install the global subscriber. Must run inside the Tokio runtime when an
/// OTLP endpoint is set.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    // Option<Layer> implements Layer, so only the selected format is active
    let (text_layer, json_layer) = match config.log_format {
        LogFormat::Text => (
            Some(fmt::layer().with_target(true).with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = otlp_tracer(endpoint, &config.service_name)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::TelemetryError(format!("failed to initialize subscriber: {e}")))
}

/// Flush pending spans
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
