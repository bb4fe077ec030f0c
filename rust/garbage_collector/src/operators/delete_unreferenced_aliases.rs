use std::time::Duration;

use async_trait::async_trait;
use librarian_error::{ErrorCodes, LibrarianError, WrappedSqlxError};
use librarian_sqlite::{quote_identifier, SchemaIntrospector, SqliteDb};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, Sqlite};
use thiserror::Error;

use super::{cutoff_timestamp, Operator, StageInput};
use crate::loop_tuner::{LoopTuner, TunableLoop};

const ALIAS_TABLE: &str = "library_file_alias";
const ALIAS_KEY: &str = "id";

/// Deletes aliases that no other table references and that are either
/// detached from their content or old enough not to be an upload in flight.
/// The referencing tables are discovered from the schema.
#[derive(Clone, Debug)]
pub struct DeleteUnreferencedAliasesOperator {
    db: SqliteDb,
    tuner: LoopTuner,
    grace: Duration,
    min_references: usize,
}

impl DeleteUnreferencedAliasesOperator {
    pub fn new(db: SqliteDb, tuner: LoopTuner, grace: Duration, min_references: usize) -> Self {
        Self {
            db,
            tuner,
            grace,
            min_references,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteUnreferencedAliasesOutput {
    pub references: usize,
    pub aliases_deleted: u64,
}

#[derive(Error, Debug)]
pub enum DeleteUnreferencedAliasesError {
    #[error("Error deleting unreferenced aliases: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Error discovering references to aliases: {0}")]
    Introspection(#[from] WrappedSqlxError),
    #[error("Found {found} references to library_file_alias.id, expected at least {minimum}")]
    TooFewReferences { found: usize, minimum: usize },
}

impl LibrarianError for DeleteUnreferencedAliasesError {
    fn code(&self) -> ErrorCodes {
        match self {
            DeleteUnreferencedAliasesError::Database(_) => ErrorCodes::Internal,
            DeleteUnreferencedAliasesError::Introspection(err) => err.code(),
            DeleteUnreferencedAliasesError::TooFewReferences { .. } => {
                ErrorCodes::FailedPrecondition
            }
        }
    }
}

/// Deletes the ids collected in `temp.unreferenced_alias` in id order.
struct DeleteAliasesLoop {
    conn: PoolConnection<Sqlite>,
    cursor: i64,
    deleted: u64,
    done: bool,
}

#[async_trait]
impl TunableLoop for DeleteAliasesLoop {
    type Error = sqlx::Error;

    fn is_done(&self) -> bool {
        self.done
    }

    async fn run_chunk(&mut self, chunk_size: usize) -> Result<(), sqlx::Error> {
        let upper: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(id) FROM (
                SELECT id FROM unreferenced_alias WHERE id > $1 ORDER BY id LIMIT $2
            )
            "#,
        )
        .bind(self.cursor)
        .bind(chunk_size as i64)
        .fetch_one(&mut *self.conn)
        .await?;
        let Some(upper) = upper else {
            self.done = true;
            return Ok(());
        };
        let result = sqlx::query(
            r#"
            DELETE FROM library_file_alias WHERE id IN (
                SELECT id FROM unreferenced_alias WHERE id > $1 AND id <= $2
            )
            "#,
        )
        .bind(self.cursor)
        .bind(upper)
        .execute(&mut *self.conn)
        .await?;
        tracing::debug!(
            from = self.cursor,
            to = upper,
            deleted = result.rows_affected(),
            "Deleted unreferenced aliases"
        );
        self.deleted += result.rows_affected();
        self.cursor = upper;
        Ok(())
    }
}

#[async_trait]
impl Operator<StageInput, DeleteUnreferencedAliasesOutput> for DeleteUnreferencedAliasesOperator {
    type Error = DeleteUnreferencedAliasesError;

    fn get_name(&self) -> &'static str {
        "delete_unreferenced_aliases"
    }

    async fn run(
        &self,
        input: &StageInput,
    ) -> Result<DeleteUnreferencedAliasesOutput, DeleteUnreferencedAliasesError> {
        let references = self.db.references_to(ALIAS_TABLE, ALIAS_KEY).await?;
        if references.len() < self.min_references {
            return Err(DeleteUnreferencedAliasesError::TooFewReferences {
                found: references.len(),
                minimum: self.min_references,
            });
        }
        tracing::info!(references = references.len(), "Discovered references to aliases");

        // Temporary tables live on one connection.
        let mut conn = self.db.get_conn().acquire().await?;
        (&mut *conn).execute(sqlx::raw_sql(
            r#"
            DROP TABLE IF EXISTS temp.referenced_alias;
            DROP TABLE IF EXISTS temp.unreferenced_alias;
            CREATE TEMP TABLE referenced_alias (alias INTEGER PRIMARY KEY);
            CREATE TEMP TABLE unreferenced_alias (id INTEGER PRIMARY KEY);
            "#,
        ))
        .await?;

        // One statement per reference, each committed on its own.
        for reference in &references {
            let column = quote_identifier(&reference.column);
            let result = sqlx::query(&format!(
                "INSERT OR IGNORE INTO referenced_alias (alias) \
                 SELECT {column} FROM main.{table} WHERE {column} IS NOT NULL",
                table = quote_identifier(&reference.table),
            ))
            .execute(&mut *conn)
            .await?;
            tracing::debug!(
                reference = %reference,
                aliases = result.rows_affected(),
                "Collected referenced aliases"
            );
        }

        let candidates = sqlx::query(
            r#"
            INSERT INTO unreferenced_alias (id)
            SELECT id FROM library_file_alias
            WHERE (
                content IS NULL
                OR ((expires IS NULL OR expires >= $1) AND date_created < $1)
            )
            AND id NOT IN (SELECT alias FROM referenced_alias)
            "#,
        )
        .bind(cutoff_timestamp(input.now, self.grace))
        .execute(&mut *conn)
        .await?;
        tracing::info!(
            candidates = candidates.rows_affected(),
            "Found unreferenced aliases"
        );

        let mut work = DeleteAliasesLoop {
            conn,
            cursor: i64::MIN,
            deleted: 0,
            done: false,
        };
        self.tuner.run(&mut work).await?;
        (&mut *work.conn).execute(sqlx::raw_sql(
            "DROP TABLE temp.referenced_alias; DROP TABLE temp.unreferenced_alias;",
        ))
        .await?;

        tracing::info!(aliases_deleted = work.deleted, "Deleted unreferenced aliases");
        Ok(DeleteUnreferencedAliasesOutput {
            references: references.len(),
            aliases_deleted: work.deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::{TestLibrarian, DAY};

    fn operator(librarian: &TestLibrarian, min_references: usize) -> DeleteUnreferencedAliasesOperator {
        DeleteUnreferencedAliasesOperator::new(
            librarian.ctx.db.clone(),
            librarian.ctx.tuner(),
            librarian.ctx.policy.alias_expiry_grace,
            min_references,
        )
    }

    async fn input(librarian: &TestLibrarian) -> StageInput {
        StageInput {
            now: librarian.ctx.db.now().await.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_referenced_aliases_survive() {
        let librarian = TestLibrarian::new().await;
        librarian
            .execute(
                r#"
                CREATE TABLE bug_attachment (
                    id INTEGER PRIMARY KEY,
                    libraryfile INTEGER REFERENCES library_file_alias (id)
                );
                CREATE TABLE "package upload" (
                    id INTEGER PRIMARY KEY,
                    "changes file" INTEGER REFERENCES library_file_alias
                );
                "#,
            )
            .await;
        let now = librarian.now().await;
        // Detached aliases, referenced or not.
        librarian.add_alias(1, None, Some(now - 10 * DAY), now - 30 * DAY).await;
        librarian.add_alias(2, None, Some(now - 10 * DAY), now - 30 * DAY).await;
        librarian.add_alias(3, None, None, now).await;
        // Old, live and unreferenced.
        librarian.add_alias(4, Some(1), None, now - 30 * DAY).await;
        // Old, live and referenced.
        librarian.add_alias(5, Some(1), None, now - 30 * DAY).await;
        // Recent and unreferenced, possibly an upload in flight.
        librarian.add_alias(6, Some(1), None, now - DAY).await;
        // Expired but not yet detached.
        librarian.add_alias(7, Some(1), Some(now - 8 * DAY), now - 30 * DAY).await;
        librarian
            .execute(
                r#"
                INSERT INTO bug_attachment (id, libraryfile) VALUES (1, 2), (2, NULL);
                INSERT INTO "package upload" (id, "changes file") VALUES (1, 5);
                "#,
            )
            .await;

        let output = operator(&librarian, 3)
            .run(&input(&librarian).await)
            .await
            .unwrap();
        // bug_attachment, package upload and temporary_blob_storage.
        assert_eq!(output.references, 3);
        assert_eq!(output.aliases_deleted, 3);

        assert_eq!(librarian.alias_content(1).await, None);
        assert_eq!(librarian.alias_content(2).await, Some(None));
        assert_eq!(librarian.alias_content(3).await, None);
        assert_eq!(librarian.alias_content(4).await, None);
        assert_eq!(librarian.alias_content(5).await, Some(Some(1)));
        assert_eq!(librarian.alias_content(6).await, Some(Some(1)));
        assert_eq!(librarian.alias_content(7).await, Some(Some(1)));

        // The temporary tables are dropped, so a second run starts clean.
        let output = operator(&librarian, 3)
            .run(&input(&librarian).await)
            .await
            .unwrap();
        assert_eq!(output.aliases_deleted, 0);
    }

    #[tokio::test]
    async fn test_deletes_in_several_chunks() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        for id in 1..=40 {
            librarian.add_alias(id, None, None, now).await;
        }
        let operator = DeleteUnreferencedAliasesOperator::new(
            librarian.ctx.db.clone(),
            LoopTuner::new(Duration::from_secs(5), 7, 1, 7),
            librarian.ctx.policy.alias_expiry_grace,
            1,
        );
        let output = operator.run(&input(&librarian).await).await.unwrap();
        assert_eq!(output.aliases_deleted, 40);
    }

    #[tokio::test]
    async fn test_implausible_reference_graph_is_fatal() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_alias(1, None, None, now).await;

        let err = operator(&librarian, 50)
            .run(&input(&librarian).await)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeleteUnreferencedAliasesError::TooFewReferences {
                found: 1,
                minimum: 50
            }
        ));
        assert_eq!(err.code(), ErrorCodes::FailedPrecondition);
        assert_eq!(librarian.alias_content(1).await, Some(None));
    }
}
