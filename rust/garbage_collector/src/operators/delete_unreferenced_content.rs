use async_trait::async_trait;
use futures::stream::StreamExt;
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::SqliteDb;
use librarian_storage::{ContentId, ContentStore, StorageError};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Executor, Sqlite};
use thiserror::Error;

use super::Operator;
use crate::loop_tuner::{LoopTuner, TunableLoop};

/// Deletes content rows no alias points at, then their bytes. Rows go
/// first: a crash in between leaves an orphaned file for the sweeps, never
/// a row without bytes.
#[derive(Clone, Debug)]
pub struct DeleteUnreferencedContentOperator {
    db: SqliteDb,
    content: ContentStore,
    tuner: LoopTuner,
    concurrency: usize,
    has_upstream: bool,
}

impl DeleteUnreferencedContentOperator {
    pub fn new(
        db: SqliteDb,
        content: ContentStore,
        tuner: LoopTuner,
        concurrency: usize,
        has_upstream: bool,
    ) -> Self {
        Self {
            db,
            content,
            tuner,
            concurrency: concurrency.max(1),
            has_upstream,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteUnreferencedContentOutput {
    pub rows_deleted: u64,
    pub files_removed: u64,
    pub objects_removed: u64,
    pub bytes_missing: u64,
}

#[derive(Error, Debug)]
pub enum DeleteUnreferencedContentError {
    #[error("Error deleting unreferenced content: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Error removing content {content_id}: {source}")]
    Storage {
        content_id: ContentId,
        #[source]
        source: StorageError,
    },
}

impl LibrarianError for DeleteUnreferencedContentError {
    fn code(&self) -> ErrorCodes {
        match self {
            DeleteUnreferencedContentError::Database(_) => ErrorCodes::Internal,
            DeleteUnreferencedContentError::Storage { source, .. } => source.code(),
        }
    }
}

struct DeleteContentLoop {
    conn: PoolConnection<Sqlite>,
    content: ContentStore,
    concurrency: usize,
    has_upstream: bool,
    cursor: ContentId,
    done: bool,
    output: DeleteUnreferencedContentOutput,
}

impl DeleteContentLoop {
    async fn remove_bytes(&mut self, ids: Vec<ContentId>) -> Result<(), DeleteUnreferencedContentError> {
        let content = self.content.clone();
        let mut removals = futures::stream::iter(ids)
            .map(|content_id| {
                let content = content.clone();
                async move { (content_id, content.remove(content_id).await) }
            })
            .buffer_unordered(self.concurrency);

        while let Some((content_id, result)) = removals.next().await {
            let removed =
                result.map_err(|source| DeleteUnreferencedContentError::Storage { content_id, source })?;
            if removed.disk {
                self.output.files_removed += 1;
            }
            if removed.remote {
                self.output.objects_removed += 1;
            }
            if !removed.any() {
                self.output.bytes_missing += 1;
                if self.has_upstream {
                    tracing::info!(content_id, "Content was never stored locally");
                } else {
                    tracing::error!(content_id, "Content was already missing when deleted");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TunableLoop for DeleteContentLoop {
    type Error = DeleteUnreferencedContentError;

    fn is_done(&self) -> bool {
        self.done
    }

    async fn run_chunk(&mut self, chunk_size: usize) -> Result<(), DeleteUnreferencedContentError> {
        let upper: Option<ContentId> = sqlx::query_scalar(
            r#"
            SELECT MAX(id) FROM (
                SELECT id FROM unreferenced_content WHERE id > $1 ORDER BY id LIMIT $2
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

        // An alias may have been pointed at the content since it was
        // collected; only rows actually deleted lose their bytes.
        let mut tx = self.conn.begin().await?;
        let deleted: Vec<ContentId> = sqlx::query_scalar(
            r#"
            DELETE FROM library_file_content
            WHERE id IN (SELECT id FROM unreferenced_content WHERE id > $1 AND id <= $2)
                AND NOT EXISTS (
                    SELECT 1 FROM library_file_alias
                    WHERE library_file_alias.content = library_file_content.id
                )
            RETURNING id
            "#,
        )
        .bind(self.cursor)
        .bind(upper)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(
            from = self.cursor,
            to = upper,
            deleted = deleted.len(),
            "Deleted unreferenced content rows"
        );
        self.cursor = upper;
        self.output.rows_deleted += deleted.len() as u64;
        self.remove_bytes(deleted).await
    }
}

#[async_trait]
impl Operator<(), DeleteUnreferencedContentOutput> for DeleteUnreferencedContentOperator {
    type Error = DeleteUnreferencedContentError;

    fn get_name(&self) -> &'static str {
        "delete_unreferenced_content"
    }

    async fn run(
        &self,
        _input: &(),
    ) -> Result<DeleteUnreferencedContentOutput, DeleteUnreferencedContentError> {
        let mut conn = self.db.get_conn().acquire().await?;
        (&mut *conn).execute(sqlx::raw_sql(
            r#"
            DROP TABLE IF EXISTS temp.unreferenced_content;
            CREATE TEMP TABLE unreferenced_content (id INTEGER PRIMARY KEY);
            "#,
        ))
        .await?;
        let candidates = sqlx::query(
            r#"
            INSERT INTO unreferenced_content (id)
            SELECT id FROM library_file_content
            WHERE NOT EXISTS (
                SELECT 1 FROM library_file_alias
                WHERE library_file_alias.content = library_file_content.id
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;
        tracing::info!(
            candidates = candidates.rows_affected(),
            "Found unreferenced content"
        );

        let mut work = DeleteContentLoop {
            conn,
            content: self.content.clone(),
            concurrency: self.concurrency,
            has_upstream: self.has_upstream,
            cursor: ContentId::MIN,
            done: false,
            output: DeleteUnreferencedContentOutput::default(),
        };
        self.tuner.run(&mut work).await?;
        (&mut *work.conn).execute(sqlx::raw_sql("DROP TABLE temp.unreferenced_content;"))
            .await?;

        tracing::info!(
            rows_deleted = work.output.rows_deleted,
            files_removed = work.output.files_removed,
            objects_removed = work.output.objects_removed,
            bytes_missing = work.output.bytes_missing,
            "Deleted unreferenced content"
        );
        Ok(work.output)
    }
}
