use config::GarbageCollectorConfig;
use context::GarbageCollectorContext;
use garbage_collector::{run_garbage_collection, GarbageCollectionOptions, GarbageCollectionReport};
use librarian_config::Configurable;
use librarian_error::LibrarianError;
use librarian_tracing::init_gc_tracing;
use tracing::{debug, info};

pub mod config;
pub mod context;
pub mod feature_flags;
pub mod garbage_collector;
pub mod loop_tuner;
pub mod operators;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod helper;

const CONFIG_PATH_ENV_VAR: &str = "CONFIG_PATH";

/// Loads configuration, installs tracing and runs one collection.
/// `config_path` takes precedence over the `CONFIG_PATH` environment variable.
pub async fn garbage_collector_entrypoint(
    config_path: Option<String>,
    options: GarbageCollectionOptions,
) -> Result<GarbageCollectionReport, Box<dyn LibrarianError>> {
    debug!("Loading configuration from environment");
    let config = match config_path.or_else(|| std::env::var(CONFIG_PATH_ENV_VAR).ok()) {
        Some(config_path) => {
            info!("Found config path: {}", config_path);
            GarbageCollectorConfig::load_from_path(&config_path)
        }
        None => {
            info!("No config path found, using default");
            GarbageCollectorConfig::load()
        }
    }
    .map_err(|err| err.boxed())?;

    init_gc_tracing(
        &config.service_name,
        &config.otel_filters,
        config.otel_endpoint.as_deref(),
    );
    info!("Loaded configuration successfully: {:#?}", config);

    let ctx = GarbageCollectorContext::try_from_config(&config).await?;
    info!(
        object_store = ctx.object_store().is_some(),
        upstream_host = ?ctx.upstream_host,
        ?options,
        "Starting garbage collection"
    );
    run_garbage_collection(&ctx, &options)
        .await
        .map_err(|err| err.boxed())
}
