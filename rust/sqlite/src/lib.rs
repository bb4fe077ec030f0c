pub mod config;
pub mod db;
mod migrations;
pub mod schema;

pub use config::{MigrationMode, SqliteDBConfig};
pub use db::{SqliteClockError, SqliteCreationError, SqliteDb};
pub use schema::{quote_identifier, ForeignKeyReference, SchemaIntrospector};
