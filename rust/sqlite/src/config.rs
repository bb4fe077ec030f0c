use std::{path::Path, time::Duration};

use crate::db::{SqliteCreationError, SqliteDb};
use async_trait::async_trait;
use librarian_config::Configurable;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::fs::create_dir_all;

fn default_migration_mode() -> MigrationMode {
    MigrationMode::Apply
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SqliteDBConfig {
    #[serde(default = "default_migration_mode")]
    pub migration_mode: MigrationMode,
    // The SQLite database URL
    // If unspecified, then the database is in memory only
    pub url: Option<String>,
}

impl Default for SqliteDBConfig {
    fn default() -> Self {
        SqliteDBConfig {
            migration_mode: default_migration_mode(),
            url: None,
        }
    }
}

/// Migration mode for the database
/// - Apply: Apply the migrations
/// - Validate: Validate the applied migrations and ensure none are unapplied
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    Apply,
    Validate,
}

//////////////////////// Configurable Implementation ////////////////////////

#[async_trait]
impl Configurable<SqliteDBConfig, SqliteCreationError> for SqliteDb {
    async fn try_from_config(config: &SqliteDBConfig) -> Result<Self, SqliteCreationError> {
        // Foreign keys stay off: the garbage collector deletes rows in
        // dependency order itself and must be able to repoint aliases freely.
        let conn_options = SqliteConnectOptions::new()
            .pragma("foreign_keys", "OFF")
            .busy_timeout(Duration::from_secs(1000));
        let conn = if let Some(url) = &config.url {
            let path = Path::new(url);
            if let Some(parent) = path.parent() {
                create_dir_all(parent).await?;
            }
            SqlitePoolOptions::new()
                .connect_with(conn_options.filename(path).create_if_missing(true))
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_lifetime(None)
                .idle_timeout(None)
                .max_connections(1)
                .connect_with(conn_options.in_memory(true).shared_cache(true))
                .await?
        };

        let db = SqliteDb::new(conn);

        db.initialize_migrations_table().await?;
        match config.migration_mode {
            MigrationMode::Apply => {
                db.apply_all_migrations().await?;
            }
            MigrationMode::Validate => db.validate_all_migrations().await?,
        }

        Ok(db)
    }
}
