use async_trait::async_trait;
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::SqliteDb;
use librarian_storage::{ContentId, ContentStore, StorageError};
use thiserror::Error;

use super::Operator;

/// Merges content rows that share a hash and size into the newest of them.
/// Aliases are repointed at the survivor; the other rows are left for
/// unreferenced content pruning to delete.
#[derive(Clone, Debug)]
pub struct MergeDuplicatesOperator {
    db: SqliteDb,
    content: ContentStore,
    has_upstream: bool,
}

impl MergeDuplicatesOperator {
    pub fn new(db: SqliteDb, content: ContentStore, has_upstream: bool) -> Self {
        Self {
            db,
            content,
            has_upstream,
        }
    }

    async fn any_present(&self, ids: &[ContentId]) -> Result<bool, StorageError> {
        for id in ids {
            if self.content.exists(*id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn log_missing_survivor(
        &self,
        survivor: ContentId,
        others: &[ContentId],
    ) -> Result<(), StorageError> {
        if self.has_upstream {
            tracing::info!(
                survivor,
                "Skipping duplicate group, survivor is only available upstream"
            );
        } else if self.any_present(others).await? {
            tracing::warn!(
                survivor,
                "Skipping duplicate group, survivor content is missing"
            );
        } else {
            tracing::error!(
                survivor,
                duplicates = ?others,
                "Skipping duplicate group, every member's content is missing"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeDuplicatesOutput {
    pub groups_merged: u64,
    pub groups_skipped: u64,
    pub aliases_repointed: u64,
}

#[derive(Error, Debug)]
pub enum MergeDuplicatesError {
    #[error("Error merging duplicates: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(
        "Content {content_id} is recorded as sha1 {expected_sha1} ({expected_size} bytes) \
         but its bytes hash to {actual_sha1} ({actual_size} bytes)"
    )]
    SurvivorCorrupt {
        content_id: ContentId,
        expected_sha1: String,
        expected_size: u64,
        actual_sha1: String,
        actual_size: u64,
    },
}

impl LibrarianError for MergeDuplicatesError {
    fn code(&self) -> ErrorCodes {
        match self {
            MergeDuplicatesError::Database(_) => ErrorCodes::Internal,
            MergeDuplicatesError::Storage(err) => err.code(),
            MergeDuplicatesError::SurvivorCorrupt { .. } => ErrorCodes::DataLoss,
        }
    }
}

#[async_trait]
impl Operator<(), MergeDuplicatesOutput> for MergeDuplicatesOperator {
    type Error = MergeDuplicatesError;

    fn get_name(&self) -> &'static str {
        "merge_duplicates"
    }

    async fn run(&self, _input: &()) -> Result<MergeDuplicatesOutput, MergeDuplicatesError> {
        let pool = self.db.get_conn();
        let mut output = MergeDuplicatesOutput::default();

        let groups: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT sha1, filesize FROM library_file_content
            GROUP BY sha1, filesize
            HAVING COUNT(*) > 1
            ORDER BY sha1, filesize
            "#,
        )
        .fetch_all(pool)
        .await?;
        tracing::info!(groups = groups.len(), "Found duplicate content groups");

        for (sha1, filesize) in groups {
            // Newest first: on a partial mirror the newest file is the most
            // likely to be present.
            let members: Vec<ContentId> = sqlx::query_scalar(
                r#"
                SELECT id FROM library_file_content
                WHERE sha1 = $1 AND filesize = $2
                ORDER BY datecreated DESC, id DESC
                "#,
            )
            .bind(&sha1)
            .bind(filesize)
            .fetch_all(pool)
            .await?;
            let Some((&survivor, others)) = members.split_first() else {
                continue;
            };
            if others.is_empty() {
                continue;
            }

            if !self.content.exists(survivor).await? {
                self.log_missing_survivor(survivor, others).await?;
                output.groups_skipped += 1;
                continue;
            }

            let (actual_sha1, actual_size) = match self.content.hash_and_length(survivor).await {
                Ok(hashed) => hashed,
                Err(err) if err.is_not_found() => {
                    tracing::warn!(survivor, "Survivor vanished while hashing, skipping group");
                    output.groups_skipped += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if actual_sha1 != sha1 || actual_size != filesize as u64 {
                return Err(MergeDuplicatesError::SurvivorCorrupt {
                    content_id: survivor,
                    expected_sha1: sha1,
                    expected_size: filesize as u64,
                    actual_sha1,
                    actual_size,
                });
            }

            let mut tx = pool.begin().await?;
            let mut repointed = 0;
            for duplicate in others {
                let result =
                    sqlx::query("UPDATE library_file_alias SET content = $1 WHERE content = $2")
                        .bind(survivor)
                        .bind(*duplicate)
                        .execute(&mut *tx)
                        .await?;
                repointed += result.rows_affected();
            }
            tx.commit().await?;

            tracing::info!(
                survivor,
                duplicates = ?others,
                aliases_repointed = repointed,
                "Merged duplicate content"
            );
            output.groups_merged += 1;
            output.aliases_repointed += repointed;
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::{TestLibrarian, DAY};
    use tracing_test::traced_test;

    fn operator(librarian: &TestLibrarian) -> MergeDuplicatesOperator {
        MergeDuplicatesOperator::new(
            librarian.ctx.db.clone(),
            librarian.ctx.content_store(),
            librarian.ctx.has_upstream(),
        )
    }

    #[tokio::test]
    async fn test_aliases_move_to_newest_member() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_content(10, b"hello", now - DAY).await;
        librarian.add_content(11, b"hello", now - 2 * DAY).await;
        librarian.add_content(12, b"other", now - 2 * DAY).await;
        for alias in 1..=3 {
            librarian.add_alias(alias, Some(11), None, now).await;
        }
        librarian.add_alias(4, Some(12), None, now).await;

        let output = operator(&librarian).run(&()).await.unwrap();
        assert_eq!(
            output,
            MergeDuplicatesOutput {
                groups_merged: 1,
                groups_skipped: 0,
                aliases_repointed: 3,
            }
        );
        for alias in 1..=3 {
            assert_eq!(librarian.alias_content(alias).await, Some(Some(10)));
        }
        assert_eq!(librarian.alias_content(4).await, Some(Some(12)));
        assert!(librarian.content_row_exists(11).await);
        assert!(librarian.ctx.local.exists(11).await.unwrap());

        // Nothing left to repoint.
        let output = operator(&librarian).run(&()).await.unwrap();
        assert_eq!(output.groups_merged, 1);
        assert_eq!(output.aliases_repointed, 0);
    }

    #[tokio::test]
    async fn test_same_age_members_prefer_highest_id() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_content(20, b"hello", now).await;
        librarian.add_content(21, b"hello", now).await;
        librarian.add_alias(1, Some(20), None, now).await;

        operator(&librarian).run(&()).await.unwrap();
        assert_eq!(librarian.alias_content(1).await, Some(Some(21)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_survivor_skips_group() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_content(10, b"hello", now - 2 * DAY).await;
        let (sha1, _) = librarian.ctx.content_store().hash_and_length(10).await.unwrap();
        // Newer, but its bytes never made it to this mirror.
        librarian.add_content_row(11, &sha1, 5, now - DAY).await;
        librarian.add_alias(1, Some(10), None, now).await;

        let output = operator(&librarian).run(&()).await.unwrap();
        assert_eq!(output.groups_skipped, 1);
        assert_eq!(output.groups_merged, 0);
        assert_eq!(librarian.alias_content(1).await, Some(Some(10)));
        assert!(logs_contain("survivor content is missing"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fully_missing_group_is_logged_as_error() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_content_row(10, "abc", 5, now - 2 * DAY).await;
        librarian.add_content_row(11, "abc", 5, now - DAY).await;

        let output = operator(&librarian).run(&()).await.unwrap();
        assert_eq!(output.groups_skipped, 1);
        assert!(logs_contain("every member's content is missing"));
    }

    #[tokio::test]
    async fn test_corrupt_survivor_is_fatal() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_content(10, b"hello", now - 2 * DAY).await;
        let (sha1, _) = librarian.ctx.content_store().hash_and_length(10).await.unwrap();
        librarian.ctx.local.put_bytes(11, b"jello").await.unwrap();
        librarian.add_content_row(11, &sha1, 5, now - DAY).await;
        librarian.add_alias(1, Some(10), None, now).await;

        let err = operator(&librarian).run(&()).await.unwrap_err();
        assert!(matches!(
            err,
            MergeDuplicatesError::SurvivorCorrupt { content_id: 11, .. }
        ));
        assert_eq!(err.code(), ErrorCodes::DataLoss);
        assert_eq!(librarian.alias_content(1).await, Some(Some(10)));
    }
}
