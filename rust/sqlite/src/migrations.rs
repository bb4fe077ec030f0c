use core::str;
use regex::Regex;
use rust_embed::Embed;
use sha2::{Digest, Sha256};
use std::{borrow::Cow, sync::LazyLock};
use thiserror::Error;

///////////// Migration Types //////////////

// A migration is a single SQL file that is executed to update the database schema
// ## Fields
// - dir: The directory where the migration file is located
// - filename: The name of the migration file
// - version: The version of the migration file
// - sql: The SQL content of the migration file
// - hash: The SHA-256 of the migration file content
#[derive(Clone, Debug)]
pub(crate) struct Migration {
    pub(crate) dir: String,
    pub(crate) filename: String,
    pub(crate) version: i32,
    pub(crate) sql: String,
    pub(crate) hash: String,
}

// A migration dir is a directory that contains migration files
// for a given subsystem
pub(crate) enum MigrationDir {
    Librarian,
}

pub(crate) const MIGRATION_DIRS: [MigrationDir; 1] = [MigrationDir::Librarian];

#[derive(Error, Debug)]
pub enum GetSourceMigrationsError {
    #[error(transparent)]
    ParseMigrationFilenameError(#[from] ParseMigrationFilenameError),
    #[error("{0}")]
    NoSuchMigrationFile(String),
    #[error("Failed to get migration file: {0}")]
    FailedToGetMigrationFile(String),
}

impl MigrationDir {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::Librarian => "librarian",
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Cow<'static, str>>> {
        match self {
            Self::Librarian => Box::new(LibrarianMigrationsFolder::iter()),
        }
    }

    fn get_file(&self, name: &str) -> Option<rust_embed::EmbeddedFile> {
        match self {
            Self::Librarian => LibrarianMigrationsFolder::get(name),
        }
    }

    /// Get the migrations that are embedded in the binary
    /// ## Returns:
    /// - Vec<Migration> - A list of migrations sorted by version in ascending order
    pub(crate) fn get_source_migrations(&self) -> Result<Vec<Migration>, GetSourceMigrationsError> {
        let mut migrations = Vec::new();

        for migration_name in self.iter() {
            let (version, _) = parse_migration_filename(&migration_name)?;
            let sql = match self.get_file(&migration_name) {
                Some(sql) => str::from_utf8(&sql.data)
                    .map_err(|_| {
                        GetSourceMigrationsError::FailedToGetMigrationFile(
                            migration_name.to_string(),
                        )
                    })?
                    // Remove CR character on Windows
                    .replace('\r', ""),
                None => {
                    return Err(GetSourceMigrationsError::NoSuchMigrationFile(
                        migration_name.to_string(),
                    ))
                }
            };
            let mut hasher = Sha256::new();
            hasher.update(sql.as_bytes());
            let hash = format!("{:x}", hasher.finalize());
            migrations.push(Migration {
                dir: self.as_str().to_string(),
                filename: migration_name.to_string(),
                version,
                sql,
                hash,
            });
        }

        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(migrations)
    }
}

///////////// MigrationDir Helpers //////////////

#[derive(Error, Debug)]
pub enum ParseMigrationFilenameError {
    #[error("Invalid migration filename: {0}")]
    InvalidMigrationFilename(String),
}

// Format is <version>-<name>.<scope>.sql, e.g. 00001-library_files.sqlite.sql
fn parse_migration_filename(filename: &str) -> Result<(i32, String), ParseMigrationFilenameError> {
    let invalid = || ParseMigrationFilenameError::InvalidMigrationFilename(filename.to_string());
    let groups = MIGRATION_FILENAME_REGEX
        .captures(filename)
        .ok_or_else(invalid)?;
    let version = groups
        .get(1)
        .and_then(|version| version.as_str().parse::<i32>().ok())
        .ok_or_else(invalid)?;
    let scope = groups.get(3).ok_or_else(invalid)?.as_str().to_string();
    Ok((version, scope))
}

static MIGRATION_FILENAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)-(.+)\.(.+)\.sql$").expect("Failed to compile regex"));

///////////// Rust Embed Migrations Data //////////////

#[derive(Embed)]
#[folder = "./migrations/librarian/"]
#[include = "*.sql"]
struct LibrarianMigrationsFolder;
