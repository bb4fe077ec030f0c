use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use librarian_error::LibrarianError;

pub mod confirm_no_clock_skew;
pub mod delete_expired_blobs;
pub mod delete_unreferenced_aliases;
pub mod delete_unreferenced_content;
pub mod delete_unwanted_files;
pub mod expire_aliases;
pub mod merge_duplicates;

/// One stage of a collection run. Operators hold their collaborators and
/// manage their own transactions, so any of them may run alone or be re-run.
#[async_trait]
pub trait Operator<I, O>: Send + Sync
where
    I: Send + Sync,
    O: Send,
{
    type Error: LibrarianError + 'static;

    fn get_name(&self) -> &'static str;

    async fn run(&self, input: &I) -> Result<O, Self::Error>;
}

/// Input of the stages that compare timestamps against the database clock.
#[derive(Debug, Clone, Copy)]
pub struct StageInput {
    pub now: DateTime<Utc>,
}

/// `now - grace` in epoch seconds, the unit timestamps are stored in.
pub(crate) fn cutoff_timestamp(now: DateTime<Utc>, grace: Duration) -> i64 {
    let grace = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
    now.timestamp().saturating_sub(grace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff_timestamp() {
        let now = DateTime::from_timestamp(1_000_000, 0).unwrap();
        assert_eq!(cutoff_timestamp(now, Duration::from_secs(86_400)), 913_600);
        assert_eq!(cutoff_timestamp(now, Duration::MAX), 1_000_000 - i64::MAX);
    }
}
