use crate::migrations::{GetSourceMigrationsError, Migration, MigrationDir, MIGRATION_DIRS};
use chrono::{DateTime, Utc};
use librarian_error::{ErrorCodes, LibrarianError, WrappedSqlxError};
use sqlx::sqlite::SqlitePool;
use sqlx::{Executor, Row};
use thiserror::Error;

#[derive(Clone, Debug)]
/// A wrapper around the librarian database pool.
/// ## Notes
/// - Cloning is cheap and clones share the same pool.
/// - Temporary tables are per connection. Callers that build one must
///   acquire a single connection from the pool and keep using it.
pub struct SqliteDb {
    conn: SqlitePool,
}

impl SqliteDb {
    pub fn new(conn: SqlitePool) -> Self {
        Self { conn }
    }

    pub fn get_conn(&self) -> &SqlitePool {
        &self.conn
    }

    /// The database's notion of the current time, truncated to seconds.
    pub async fn now(&self) -> Result<DateTime<Utc>, SqliteClockError> {
        let secs: i64 = sqlx::query_scalar("SELECT CAST(strftime('%s', 'now') AS INTEGER)")
            .fetch_one(&self.conn)
            .await
            .map_err(WrappedSqlxError)?;
        DateTime::from_timestamp(secs, 0).ok_or(SqliteClockError::OutOfRange(secs))
    }

    //////////////////////// Migrations ////////////////////////

    pub(crate) async fn apply_all_migrations(&self) -> Result<(), SqliteCreationError> {
        let mut all_unapplied_migrations = Vec::new();
        for dir in MIGRATION_DIRS.iter() {
            let applied_migrations = self.get_existing_migrations(dir).await?;
            let source_migrations = dir.get_source_migrations()?;
            let unapplied =
                self.validate_migrations_and_get_unapplied(applied_migrations, source_migrations)?;
            all_unapplied_migrations.extend(unapplied);
        }
        if !all_unapplied_migrations.is_empty() {
            tracing::info!(
                count = all_unapplied_migrations.len(),
                "Applying librarian schema migrations"
            );
        }
        self.apply_migrations(all_unapplied_migrations).await?;
        Ok(())
    }

    pub(crate) async fn validate_all_migrations(&self) -> Result<(), SqliteCreationError> {
        for dir in MIGRATION_DIRS.iter() {
            let applied_migrations = self.get_existing_migrations(dir).await?;
            let source_migrations = dir.get_source_migrations()?;
            let unapplied =
                self.validate_migrations_and_get_unapplied(applied_migrations, source_migrations)?;
            if !unapplied.is_empty() {
                return Err(SqliteCreationError::UnappliedMigrationsFound);
            }
        }
        Ok(())
    }

    /// Apply all migrations in a transaction
    async fn apply_migrations(&self, migrations: Vec<Migration>) -> Result<(), sqlx::Error> {
        let mut tx = self.conn.begin().await?;
        for migration in migrations {
            tx.execute(sqlx::query(&migration.sql)).await?;

            // Bookkeeping
            let query = r#"
                INSERT INTO migrations (dir, version, filename, sql, hash)
                VALUES ($1, $2, $3, $4, $5)
            "#;
            let query = sqlx::query(query)
                .bind(&migration.dir)
                .bind(migration.version)
                .bind(&migration.filename)
                .bind(&migration.sql)
                .bind(&migration.hash);
            tx.execute(query).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Validate migration sequence and get the migrations that need to be applied
    /// Arguments:
    /// - applied_migrations: The migrations that have been applied, in ascending version order
    /// - source_migrations: The embedded migrations, in ascending version order
    fn validate_migrations_and_get_unapplied(
        &self,
        applied_migrations: Vec<Migration>,
        source_migrations: Vec<Migration>,
    ) -> Result<Vec<Migration>, MigrationValidationError> {
        if applied_migrations.len() > source_migrations.len() {
            return Err(MigrationValidationError::UnknownAppliedMigrations(
                applied_migrations.len() - source_migrations.len(),
            ));
        }
        for (db_migration, source_migration) in
            applied_migrations.iter().zip(source_migrations.iter())
        {
            if db_migration.version != source_migration.version {
                return Err(MigrationValidationError::InconsistentVersion(
                    db_migration.version,
                    source_migration.version,
                ));
            }
            if db_migration.hash != source_migration.hash {
                return Err(MigrationValidationError::InconsistentHash(
                    db_migration.hash.clone(),
                    source_migration.hash.clone(),
                ));
            }
        }

        let unapplied = source_migrations[applied_migrations.len()..].to_vec();
        Ok(unapplied)
    }

    /// Initialize the migrations table
    /// Note:
    /// - This function is idempotent
    pub(crate) async fn initialize_migrations_table(&self) -> Result<(), sqlx::Error> {
        let query = r#"
            CREATE TABLE IF NOT EXISTS migrations (
                dir TEXT NOT NULL,
                version INTEGER NOT NULL,
                filename TEXT NOT NULL,
                sql TEXT NOT NULL,
                hash TEXT NOT NULL,
                PRIMARY KEY (dir, version)
            )
        "#;
        sqlx::query(query).execute(&self.conn).await?;
        Ok(())
    }

    /// Get existing migrations for a given directory, sorted by version in ascending order
    async fn get_existing_migrations(
        &self,
        dir: &MigrationDir,
    ) -> Result<Vec<Migration>, sqlx::Error> {
        let query = r#"
            SELECT dir, version, filename, sql, hash
            FROM migrations
            WHERE dir = $1
            ORDER BY version ASC
        "#;
        let rows = sqlx::query(query)
            .bind(dir.as_str())
            .fetch_all(&self.conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| Migration {
                dir: row.get("dir"),
                filename: row.get("filename"),
                version: row.get("version"),
                sql: row.get("sql"),
                hash: row.get("hash"),
            })
            .collect())
    }
}

//////////////////////// Error Types ////////////////////////

#[derive(Error, Debug)]
pub enum SqliteCreationError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    GetSourceMigrationsError(#[from] GetSourceMigrationsError),
    #[error(transparent)]
    MigrationValidationError(#[from] MigrationValidationError),
    #[error("Unapplied migrations found")]
    UnappliedMigrationsFound,
}

impl LibrarianError for SqliteCreationError {
    fn code(&self) -> ErrorCodes {
        match self {
            SqliteCreationError::SqlxError(_) => ErrorCodes::Internal,
            SqliteCreationError::IoError(err) => err.code(),
            SqliteCreationError::GetSourceMigrationsError(_) => ErrorCodes::Internal,
            SqliteCreationError::MigrationValidationError(_)
            | SqliteCreationError::UnappliedMigrationsFound => ErrorCodes::FailedPrecondition,
        }
    }
}

#[derive(Error, Debug)]
pub enum MigrationValidationError {
    #[error("Inconsistent version: db={0}, source={1}")]
    InconsistentVersion(i32, i32),
    #[error("Inconsistent hash: db={0}, source={1}")]
    InconsistentHash(String, String),
    #[error("Database has {0} applied migrations unknown to this binary")]
    UnknownAppliedMigrations(usize),
}

#[derive(Error, Debug)]
pub enum SqliteClockError {
    #[error("Error reading database clock: {0}")]
    Sqlx(#[from] WrappedSqlxError),
    #[error("Database clock returned an unrepresentable timestamp: {0}")]
    OutOfRange(i64),
}

impl LibrarianError for SqliteClockError {
    fn code(&self) -> ErrorCodes {
        match self {
            SqliteClockError::Sqlx(err) => err.code(),
            SqliteClockError::OutOfRange(_) => ErrorCodes::Internal,
        }
    }
}

pub mod test_utils {
    use super::SqliteDb;
    use crate::config::{MigrationMode, SqliteDBConfig};
    use librarian_config::Configurable;
    use tempfile::TempDir;

    /// A fresh database file inside a new temporary directory. The directory
    /// is removed when the returned `TempDir` is dropped.
    pub fn new_test_db_persist_path() -> (TempDir, String) {
        let dir = TempDir::new().expect("Should be able to create a temporary directory");
        let url = dir
            .path()
            .join("librarian.sqlite3")
            .to_str()
            .expect("Temporary path should be valid UTF-8")
            .to_string();
        (dir, url)
    }

    pub async fn new_test_db() -> (TempDir, SqliteDb) {
        let (dir, url) = new_test_db_persist_path();
        let config = SqliteDBConfig {
            url: Some(url),
            migration_mode: MigrationMode::Apply,
        };
        let db = SqliteDb::try_from_config(&config)
            .await
            .expect("Test database should be created");
        (dir, db)
    }
}
