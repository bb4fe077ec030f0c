use opentelemetry::trace::TracerProvider;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt;
use tracing_subscriber::Registry;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtelFilterLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for OtelFilterLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtelFilterLevel::Trace => f.write_str("trace"),
            OtelFilterLevel::Debug => f.write_str("debug"),
            OtelFilterLevel::Info => f.write_str("info"),
            OtelFilterLevel::Warn => f.write_str("warn"),
            OtelFilterLevel::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtelFilter {
    pub crate_name: String,
    pub filter_level: OtelFilterLevel,
}

/// Filter directives used when `RUST_LOG` is not set.
pub fn global_filter_directives(custom_filters: &[OtelFilter]) -> String {
    // These need to have underscores because the Rust compiler automatically
    // converts all hyphens in crate names to underscores to make them valid
    // Rust identifiers
    let default_crate_names = [
        "librarian_config",
        "librarian_error",
        "librarian_gc",
        "librarian_gc_library",
        "librarian_sqlite",
        "librarian_storage",
        "librarian_tracing",
    ];

    let mut directives = vec!["error".to_string(), "sqlx=warn".to_string()];
    directives.extend(default_crate_names.iter().map(|s| format!("{s}=trace")));
    directives.extend(
        custom_filters
            .iter()
            .map(|custom_filter| format!("{}={}", custom_filter.crate_name, custom_filter.filter_level)),
    );
    directives.join(",")
}

pub fn init_global_filter_layer(
    custom_filters: &[OtelFilter],
) -> Box<dyn Layer<Registry> + Send + Sync> {
    EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| global_filter_directives(custom_filters)),
    )
    .boxed()
}

pub fn init_otel_layer(
    service_name: &str,
    otel_endpoint: &str,
) -> Result<Box<dyn Layer<Registry> + Send + Sync>, opentelemetry::trace::TraceError> {
    tracing::info!(
        "Registering otel subscriber for {} at endpoint {}",
        service_name,
        otel_endpoint
    );
    let resource = opentelemetry_sdk::Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new(
            "service.host_name",
            std::env::var("HOSTNAME").unwrap_or("unknown".to_string()),
        ),
    ]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otel_endpoint)
        .build()?;
    let trace_config = opentelemetry_sdk::trace::Config::default().with_resource(resource);
    let tracer_provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(trace_config)
        .build();
    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);
    Ok(tracing_opentelemetry::OpenTelemetryLayer::new(tracer).boxed())
}

pub fn init_stdout_layer() -> Box<dyn Layer<Registry> + Send + Sync> {
    fmt::layer().pretty().with_target(false).boxed()
}

pub fn init_tracing(layers: Vec<Box<dyn Layer<Registry> + Send + Sync>>) {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let Some(layers) = layers
        .into_iter()
        .reduce(|a, b| Box::new(a.and_then(b)))
    else {
        return;
    };
    let subscriber = tracing_subscriber::registry().with(layers);
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Global tracing subscriber was already set: {err}");
        return;
    }
    tracing::info!("Global tracing subscriber set");
}

pub fn init_panic_tracing_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();

        let payload = if let Some(s) = payload.downcast_ref::<&str>() {
            Some(&**s)
        } else {
            payload.downcast_ref::<String>().map(|s| s.as_str())
        };

        tracing::error!(
            panic.payload = payload,
            panic.location = panic_info.location().map(|l| l.to_string()),
            panic.backtrace = tracing::field::display(std::backtrace::Backtrace::capture()),
            "A panic occurred"
        );

        prev_hook(panic_info);
    }));
}

/// Installs the global filter, the stdout layer and, when an endpoint is
/// configured, the otel exporter. A failing exporter is logged and skipped.
pub fn init_gc_tracing(
    service_name: &str,
    custom_filters: &[OtelFilter],
    otel_endpoint: Option<&str>,
) {
    let mut layers = vec![
        // The global filter applies to all subsequent layers
        init_global_filter_layer(custom_filters),
        init_stdout_layer(),
    ];
    let otel_error = match otel_endpoint {
        Some(endpoint) => match init_otel_layer(service_name, endpoint) {
            Ok(layer) => {
                layers.push(layer);
                None
            }
            Err(err) => Some(err),
        },
        None => None,
    };
    init_tracing(layers);
    init_panic_tracing_hook();
    if let Some(err) = otel_error {
        tracing::error!("Could not build otel exporter, continuing without it: {err}");
    }
}
