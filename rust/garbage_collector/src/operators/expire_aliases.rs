use std::time::Duration;

use async_trait::async_trait;
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::SqliteDb;
use sqlx::SqlitePool;
use thiserror::Error;

use super::{cutoff_timestamp, Operator, StageInput};
use crate::loop_tuner::{LoopTuner, TunableLoop};

/// Detaches aliases from their content once they are past `expires` by more
/// than the grace period. A detached alias is never reattached.
#[derive(Clone, Debug)]
pub struct ExpireAliasesOperator {
    db: SqliteDb,
    tuner: LoopTuner,
    grace: Duration,
}

impl ExpireAliasesOperator {
    pub fn new(db: SqliteDb, tuner: LoopTuner, grace: Duration) -> Self {
        Self { db, tuner, grace }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExpireAliasesOutput {
    pub aliases_expired: u64,
}

#[derive(Error, Debug)]
pub enum ExpireAliasesError {
    #[error("Error expiring aliases: {0}")]
    Database(#[from] sqlx::Error),
}

impl LibrarianError for ExpireAliasesError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Internal
    }
}

struct ExpireAliasesLoop<'a> {
    pool: &'a SqlitePool,
    cutoff: i64,
    expired: u64,
    done: bool,
}

#[async_trait]
impl<'a> TunableLoop for ExpireAliasesLoop<'a> {
    type Error = sqlx::Error;

    fn is_done(&self) -> bool {
        self.done
    }

    async fn run_chunk(&mut self, chunk_size: usize) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE library_file_alias SET content = NULL
            WHERE id IN (
                SELECT id FROM library_file_alias
                WHERE content IS NOT NULL AND expires < $1
                ORDER BY id
                LIMIT $2
            )
            "#,
        )
        .bind(self.cutoff)
        .bind(chunk_size as i64)
        .execute(self.pool)
        .await?;
        self.expired += result.rows_affected();
        self.done = result.rows_affected() == 0;
        Ok(())
    }
}

#[async_trait]
impl Operator<StageInput, ExpireAliasesOutput> for ExpireAliasesOperator {
    type Error = ExpireAliasesError;

    fn get_name(&self) -> &'static str {
        "expire_aliases"
    }

    async fn run(&self, input: &StageInput) -> Result<ExpireAliasesOutput, ExpireAliasesError> {
        let mut work = ExpireAliasesLoop {
            pool: self.db.get_conn(),
            cutoff: cutoff_timestamp(input.now, self.grace),
            expired: 0,
            done: false,
        };
        self.tuner.run(&mut work).await?;
        tracing::info!(aliases_expired = work.expired, "Expired aliases");
        Ok(ExpireAliasesOutput {
            aliases_expired: work.expired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::{TestLibrarian, DAY};

    #[tokio::test]
    async fn test_expires_only_past_grace() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        librarian.add_content(1, b"hello", now - 30 * DAY).await;
        // Expired well past the one week grace.
        librarian.add_alias(1, Some(1), Some(now - 10 * DAY), now - 30 * DAY).await;
        librarian.add_alias(2, Some(1), Some(now - 8 * DAY), now - 30 * DAY).await;
        // Expired, but still inside the grace period.
        librarian.add_alias(3, Some(1), Some(now - DAY), now - 30 * DAY).await;
        // Not expired, or never expiring.
        librarian.add_alias(4, Some(1), Some(now + DAY), now - 30 * DAY).await;
        librarian.add_alias(5, Some(1), None, now - 30 * DAY).await;

        let operator = ExpireAliasesOperator::new(
            librarian.ctx.db.clone(),
            librarian.ctx.tuner(),
            librarian.ctx.policy.alias_expiry_grace,
        );
        let input = StageInput {
            now: librarian.ctx.db.now().await.unwrap(),
        };
        let output = operator.run(&input).await.unwrap();
        assert_eq!(output.aliases_expired, 2);

        assert_eq!(librarian.alias_content(1).await, Some(None));
        assert_eq!(librarian.alias_content(2).await, Some(None));
        assert_eq!(librarian.alias_content(3).await, Some(Some(1)));
        assert_eq!(librarian.alias_content(4).await, Some(Some(1)));
        assert_eq!(librarian.alias_content(5).await, Some(Some(1)));

        let output = operator.run(&input).await.unwrap();
        assert_eq!(output.aliases_expired, 0);
    }

    #[tokio::test]
    async fn test_expires_in_several_chunks() {
        let librarian = TestLibrarian::new().await;
        let now = librarian.now().await;
        for id in 1..=25 {
            librarian.add_alias(id, Some(7), Some(now - 10 * DAY), now - 30 * DAY).await;
        }
        let operator = ExpireAliasesOperator::new(
            librarian.ctx.db.clone(),
            LoopTuner::new(Duration::from_secs(5), 3, 1, 3),
            librarian.ctx.policy.alias_expiry_grace,
        );
        let output = operator
            .run(&StageInput {
                now: librarian.ctx.db.now().await.unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(output.aliases_expired, 25);
    }
}
