use async_trait::async_trait;
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::SqliteDb;
use thiserror::Error;

use super::{Operator, StageInput};

/// Deletes temporary upload blobs whose alias has expired, together with
/// the jobs that would have consumed them. The aliases are left for
/// unreferenced alias pruning.
#[derive(Clone, Debug)]
pub struct DeleteExpiredBlobsOperator {
    db: SqliteDb,
}

impl DeleteExpiredBlobsOperator {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteExpiredBlobsOutput {
    pub jobs_deleted: u64,
    pub blobs_deleted: u64,
}

#[derive(Error, Debug)]
pub enum DeleteExpiredBlobsError {
    #[error("Error deleting expired blobs: {0}")]
    Database(#[from] sqlx::Error),
}

impl LibrarianError for DeleteExpiredBlobsError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}

#[async_trait]
impl Operator<StageInput, DeleteExpiredBlobsOutput> for DeleteExpiredBlobsOperator {
    type Error = DeleteExpiredBlobsError;

    fn get_name(&self) -> &'static str {
        "delete_expired_blobs"
    }

    async fn run(
        &self,
        input: &StageInput,
    ) -> Result<DeleteExpiredBlobsOutput, DeleteExpiredBlobsError> {
        let now = input.now.timestamp();
        let mut tx = self.db.get_conn().begin().await?;

        let jobs = sqlx::query(
            r#"
            DELETE FROM job WHERE id IN (
                SELECT blob_job.job
                FROM blob_job
                JOIN temporary_blob_storage ON temporary_blob_storage.id = blob_job.blob
                JOIN library_file_alias ON library_file_alias.id = temporary_blob_storage.file_alias
                WHERE library_file_alias.expires < $1
            )
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM blob_job WHERE blob IN (
                SELECT temporary_blob_storage.id
                FROM temporary_blob_storage
                JOIN library_file_alias ON library_file_alias.id = temporary_blob_storage.file_alias
                WHERE library_file_alias.expires < $1
            )
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let blobs = sqlx::query(
            r#"
            DELETE FROM temporary_blob_storage WHERE file_alias IN (
                SELECT id FROM library_file_alias WHERE expires < $1
            )
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let output = DeleteExpiredBlobsOutput {
            jobs_deleted: jobs.rows_affected(),
            blobs_deleted: blobs.rows_affected(),
        };
        tracing::info!(
            jobs_deleted = output.jobs_deleted,
            blobs_deleted = output.blobs_deleted,
            "Deleted expired temporary blobs"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::{TestLibrarian, DAY};

    #[tokio::test]
    async fn test_deletes_expired_blobs_and_their_jobs() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_alias(1, Some(1), Some(now - DAY), now - 2 * DAY).await;
        librarian.add_alias(2, Some(2), Some(now + DAY), now - 2 * DAY).await;
        librarian
            .execute(&format!(
                r#"
                INSERT INTO temporary_blob_storage (id, uuid, file_alias, date_created)
                    VALUES (1, 'expired', 1, {now}), (2, 'live', 2, {now});
                INSERT INTO job (id, status, date_created) VALUES (1, 0, {now}), (2, 0, {now});
                INSERT INTO blob_job (job, blob) VALUES (1, 1), (2, 2);
                "#
            ))
            .await;

        let operator = DeleteExpiredBlobsOperator::new(librarian.ctx.db.clone());
        let output = operator
            .run(&StageInput {
                now: librarian.ctx.db.now().await.unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(
            output,
            DeleteExpiredBlobsOutput {
                jobs_deleted: 1,
                blobs_deleted: 1,
            }
        );

        let remaining: Vec<(i64, i64)> = sqlx::query_as("SELECT job, blob FROM blob_job")
            .fetch_all(librarian.ctx.db.get_conn())
            .await
            .unwrap();
        assert_eq!(remaining, vec![(2, 2)]);
        let jobs: Vec<i64> = sqlx::query_scalar("SELECT id FROM job")
            .fetch_all(librarian.ctx.db.get_conn())
            .await
            .unwrap();
        assert_eq!(jobs, vec![2]);
        // The alias itself is left for alias pruning.
        assert_eq!(librarian.alias_content(1).await, Some(Some(1)));
    }
}
