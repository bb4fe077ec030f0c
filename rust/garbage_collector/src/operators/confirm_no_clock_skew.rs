use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::{SqliteClockError, SqliteDb};
use thiserror::Error;

use super::Operator;

/// Refuses to continue when the database and local clocks disagree. Every
/// later stage decides "expired" and "old enough" from the database clock.
#[derive(Clone, Debug)]
pub struct ConfirmNoClockSkewOperator {
    db: SqliteDb,
    max_skew: Duration,
}

impl ConfirmNoClockSkewOperator {
    pub fn new(db: SqliteDb, max_skew: Duration) -> Self {
        Self { db, max_skew }
    }
}

#[derive(Debug)]
pub struct ConfirmNoClockSkewInput {
    pub local_now: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ConfirmNoClockSkewOutput {
    pub db_now: DateTime<Utc>,
    pub skew_secs: i64,
}

#[derive(Error, Debug)]
pub enum ConfirmNoClockSkewError {
    #[error(transparent)]
    Clock(#[from] SqliteClockError),
    #[error("Database clock {db_now} and local clock {local_now} differ by more than {max_skew_secs}s")]
    ClockSkew {
        db_now: DateTime<Utc>,
        local_now: DateTime<Utc>,
        max_skew_secs: u64,
    },
}

impl LibrarianError for ConfirmNoClockSkewError {
    fn code(&self) -> ErrorCodes {
        match self {
            ConfirmNoClockSkewError::Clock(err) => err.code(),
            ConfirmNoClockSkewError::ClockSkew { .. } => ErrorCodes::FailedPrecondition,
        }
    }
}

#[async_trait]
impl Operator<ConfirmNoClockSkewInput, ConfirmNoClockSkewOutput> for ConfirmNoClockSkewOperator {
    type Error = ConfirmNoClockSkewError;

    fn get_name(&self) -> &'static str {
        "confirm_no_clock_skew"
    }

    async fn run(
        &self,
        input: &ConfirmNoClockSkewInput,
    ) -> Result<ConfirmNoClockSkewOutput, ConfirmNoClockSkewError> {
        let db_now = self.db.now().await?;
        let skew_secs = db_now.timestamp() - input.local_now.timestamp();
        if skew_secs.unsigned_abs() > self.max_skew.as_secs() {
            return Err(ConfirmNoClockSkewError::ClockSkew {
                db_now,
                local_now: input.local_now,
                max_skew_secs: self.max_skew.as_secs(),
            });
        }
        tracing::debug!(skew_secs, "Database and local clocks agree");
        Ok(ConfirmNoClockSkewOutput { db_now, skew_secs })
    }
}
