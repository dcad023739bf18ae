use std::sync::{Arc, OnceLock};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::{Resource, trace};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{AppConfig, TelemetryConfig};

static SUBSCRIBER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Owns the tracer provider so buffered spans are exported when the service exits.
#[derive(Clone, Default)]
pub struct TelemetryGuard {
    provider: Option<Arc<SdkTracerProvider>>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if Arc::strong_count(&provider) == 1 {
                let _ = provider.shutdown();
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
}

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`), pretty
/// output in `dev` and JSON lines elsewhere, plus OTLP span export when enabled.
/// Calling it again after a subscriber is installed is a no-op.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(TelemetryGuard::default());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let (tracer, provider) = build_tracer(app, telemetry)?;

    let fmt_layer = if uses_json_output(&app.env) {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr)
            .boxed()
    };
    let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;
    let _ = SUBSCRIBER_INSTALLED.set(());

    Ok(TelemetryGuard { provider })
}

fn uses_json_output(env: &str) -> bool {
    !env.eq_ignore_ascii_case("dev")
}

fn build_tracer(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<(Option<trace::Tracer>, Option<Arc<SdkTracerProvider>>), TelemetryError> {
    if !telemetry.export_traces {
        return Ok((None, None));
    }

    let endpoint = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => endpoint,
        _ => return Ok((None, None)),
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(Duration::from_secs(3))
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::ExporterBuild(err.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", app.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", app.env.clone()),
        ])
        .build();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build())
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(app.service_name.clone());

    Ok((Some(tracer), Some(Arc::new(provider))))
}

/// Logging-only initializer for tools and tests that run without a config file.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "mailsift".to_string(),
        port: 0,
        env: env.to_string(),
    };
    let telemetry = TelemetryConfig {
        otlp_endpoint: None,
        export_traces: false,
    };
    init_telemetry(&app, &telemetry).map(|_guard| ())
}
