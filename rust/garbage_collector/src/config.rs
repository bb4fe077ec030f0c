use std::collections::HashMap;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use librarian_config::helpers::{
    deserialize_duration_from_seconds, serialize_duration_to_seconds,
};
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::SqliteDBConfig;
use librarian_storage::config::StorageConfig;
use librarian_tracing::OtelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "./librarian_gc_config.yaml";

fn default_service_name() -> String {
    "librarian-gc".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GarbageCollectorConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub otel_endpoint: Option<String>,
    #[serde(default)]
    pub otel_filters: Vec<OtelFilter>,
    #[serde(default)]
    pub sqlite: SqliteDBConfig,
    pub storage: StorageConfig,
    /// Host of an upstream librarian that serves content missing locally.
    /// When set, content missing from this librarian is expected.
    #[serde(default)]
    pub upstream_host: Option<String>,
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
    #[serde(default)]
    pub policy: GcPolicyConfig,
}

fn default_alias_expiry_grace() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_orphan_file_grace() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_clock_skew() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_chunk_goal() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_chunk_size() -> usize {
    1000
}

fn default_min_chunk_size() -> usize {
    10
}

fn default_max_chunk_size() -> usize {
    100_000
}

fn default_deletion_concurrency() -> usize {
    10
}

fn default_min_alias_references() -> usize {
    1
}

/// Thresholds and batch sizes of a collection run. Durations are given in
/// seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcPolicyConfig {
    /// How long past `expires` an alias keeps its content, and how old an
    /// unreferenced alias must be before it is deleted.
    #[serde(
        default = "default_alias_expiry_grace",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub alias_expiry_grace: Duration,
    /// Minimum age of an unwanted file or object before the sweeps delete it.
    #[serde(
        default = "default_orphan_file_grace",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub orphan_file_grace: Duration,
    #[serde(
        default = "default_max_clock_skew",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub max_clock_skew: Duration,
    /// Target duration of one chunk of a tuned loop.
    #[serde(
        default = "default_chunk_goal",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub chunk_goal: Duration,
    #[serde(default = "default_initial_chunk_size")]
    pub initial_chunk_size: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_deletion_concurrency")]
    pub deletion_concurrency: usize,
    /// Fewer foreign keys to aliases than this means schema discovery is broken.
    #[serde(default = "default_min_alias_references")]
    pub min_alias_references: usize,
}

impl Default for GcPolicyConfig {
    fn default() -> Self {
        GcPolicyConfig {
            alias_expiry_grace: default_alias_expiry_grace(),
            orphan_file_grace: default_orphan_file_grace(),
            max_clock_skew: default_max_clock_skew(),
            chunk_goal: default_chunk_goal(),
            initial_chunk_size: default_initial_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            deletion_concurrency: default_deletion_concurrency(),
            min_alias_references: default_min_alias_references(),
        }
    }
}

#[derive(Error, Debug)]
pub enum GarbageCollectorConfigError {
    #[error("Error loading config: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl LibrarianError for GarbageCollectorConfigError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

impl GarbageCollectorConfig {
    pub fn load() -> Result<Self, GarbageCollectorConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from_path(path: &str) -> Result<Self, GarbageCollectorConfigError> {
        // Unfortunately, figment doesn't support environment variables with underscores. So we have to map and replace them.
        // Excluding our own environment variables, which are prefixed with LIBRARIAN_GC_.
        let mut f = figment::Figment::from(
            Env::prefixed("LIBRARIAN_GC_").map(|k| k.as_str().replace("__", ".").into()),
        );
        if std::path::Path::new(path).exists() {
            f = figment::Figment::from(Yaml::file(path)).merge(f);
        }
        f.extract().map_err(|err| Box::new(err).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use librarian_sqlite::MigrationMode;
    use librarian_storage::config::ObjectStoreConfig;

    #[test]
    fn test_load_config() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "librarian_gc_config.yaml",
                r#"
                service_name: "librarian-gc"
                otel_endpoint: "http://otel-collector:4317"
                sqlite:
                    url: "/srv/librarian/librarian.sqlite3"
                    migration_mode: "validate"
                storage:
                    root: "/srv/librarian"
                    object_store:
                        s3:
                            bucket: "librarian"
                feature_flags:
                    "librarian.object_store.enabled": true
                policy:
                    orphan_file_grace: 3600
                "#,
            )?;
            let config = GarbageCollectorConfig::load().expect("config should load");
            assert_eq!(config.service_name, "librarian-gc");
            assert_eq!(
                config.otel_endpoint.as_deref(),
                Some("http://otel-collector:4317")
            );
            assert_eq!(config.sqlite.migration_mode, MigrationMode::Validate);
            assert_eq!(config.storage.root, "/srv/librarian");
            assert!(matches!(
                config.storage.object_store,
                Some(ObjectStoreConfig::S3(ref s3)) if s3.bucket == "librarian"
            ));
            assert_eq!(
                config.feature_flags.get("librarian.object_store.enabled"),
                Some(&true)
            );
            assert_eq!(config.policy.orphan_file_grace, Duration::from_secs(3600));
            assert_eq!(
                config.policy.alias_expiry_grace,
                Duration::from_secs(604_800)
            );
            assert_eq!(config.policy.deletion_concurrency, 10);
            assert_eq!(config.upstream_host, None);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "gc.yaml",
                r#"
                storage:
                    root: "/srv/librarian"
                policy:
                    chunk_goal: 5
                "#,
            )?;
            jail.set_env("LIBRARIAN_GC_UPSTREAM_HOST", "librarian.upstream");
            jail.set_env("LIBRARIAN_GC_POLICY__CHUNK_GOAL", "2");
            jail.set_env("LIBRARIAN_GC_STORAGE__ROOT", "/var/tmp/librarian");
            let config = GarbageCollectorConfig::load_from_path("gc.yaml")
                .expect("config should load");
            assert_eq!(config.service_name, "librarian-gc");
            assert_eq!(config.upstream_host.as_deref(), Some("librarian.upstream"));
            assert_eq!(config.policy.chunk_goal, Duration::from_secs(2));
            assert_eq!(config.storage.root, "/var/tmp/librarian");
            assert!(config.sqlite.url.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_missing_storage_is_an_error() {
        figment::Jail::expect_with(|_jail| {
            let err = GarbageCollectorConfig::load_from_path("does-not-exist.yaml").unwrap_err();
            assert_eq!(err.code(), ErrorCodes::InvalidArgument);
            Ok(())
        });
    }
}
