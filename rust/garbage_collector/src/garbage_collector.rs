use std::time::Instant;

use chrono::Utc;
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::SqliteClockError;
use thiserror::Error;

use crate::context::GarbageCollectorContext;
use crate::operators::confirm_no_clock_skew::{
    ConfirmNoClockSkewError, ConfirmNoClockSkewInput, ConfirmNoClockSkewOperator,
};
use crate::operators::delete_expired_blobs::{
    DeleteExpiredBlobsError, DeleteExpiredBlobsOperator, DeleteExpiredBlobsOutput,
};
use crate::operators::delete_unreferenced_aliases::{
    DeleteUnreferencedAliasesError, DeleteUnreferencedAliasesOperator,
    DeleteUnreferencedAliasesOutput,
};
use crate::operators::delete_unreferenced_content::{
    DeleteUnreferencedContentError, DeleteUnreferencedContentOperator,
    DeleteUnreferencedContentOutput,
};
use crate::operators::delete_unwanted_files::{
    DeleteUnwantedFilesError, DeleteUnwantedFilesOperator, DeleteUnwantedFilesOutput,
    DeleteUnwantedObjectsOperator,
};
use crate::operators::expire_aliases::{
    ExpireAliasesError, ExpireAliasesOperator, ExpireAliasesOutput,
};
use crate::operators::merge_duplicates::{
    MergeDuplicatesError, MergeDuplicatesOperator, MergeDuplicatesOutput,
};
use crate::operators::{Operator, StageInput};

/// Stages to leave out of a run. The clock check always runs.
#[derive(Debug, Clone, Default)]
pub struct GarbageCollectionOptions {
    pub skip_expiry: bool,
    pub skip_duplicates: bool,
    pub skip_blobs: bool,
    pub skip_aliases: bool,
    pub skip_content: bool,
    pub skip_files: bool,
}

/// What each stage did. Skipped stages are `None`.
#[derive(Debug, Default)]
pub struct GarbageCollectionReport {
    pub expire_aliases: Option<ExpireAliasesOutput>,
    pub merge_duplicates: Option<MergeDuplicatesOutput>,
    pub delete_expired_blobs: Option<DeleteExpiredBlobsOutput>,
    pub delete_unreferenced_aliases: Option<DeleteUnreferencedAliasesOutput>,
    pub delete_unreferenced_content: Option<DeleteUnreferencedContentOutput>,
    pub delete_unwanted_files: Option<DeleteUnwantedFilesOutput>,
    pub delete_unwanted_objects: Option<DeleteUnwantedFilesOutput>,
}

#[derive(Error, Debug)]
pub enum GarbageCollectorError {
    #[error(transparent)]
    Clock(#[from] SqliteClockError),
    #[error(transparent)]
    ClockSkew(#[from] ConfirmNoClockSkewError),
    #[error(transparent)]
    ExpireAliases(#[from] ExpireAliasesError),
    #[error(transparent)]
    MergeDuplicates(#[from] MergeDuplicatesError),
    #[error(transparent)]
    DeleteExpiredBlobs(#[from] DeleteExpiredBlobsError),
    #[error(transparent)]
    DeleteUnreferencedAliases(#[from] DeleteUnreferencedAliasesError),
    #[error(transparent)]
    DeleteUnreferencedContent(#[from] DeleteUnreferencedContentError),
    #[error(transparent)]
    DeleteUnwantedFiles(#[from] DeleteUnwantedFilesError),
}

impl LibrarianError for GarbageCollectorError {
    fn code(&self) -> ErrorCodes {
        match self {
            GarbageCollectorError::Clock(err) => err.code(),
            GarbageCollectorError::ClockSkew(err) => err.code(),
            GarbageCollectorError::ExpireAliases(err) => err.code(),
            GarbageCollectorError::MergeDuplicates(err) => err.code(),
            GarbageCollectorError::DeleteExpiredBlobs(err) => err.code(),
            GarbageCollectorError::DeleteUnreferencedAliases(err) => err.code(),
            GarbageCollectorError::DeleteUnreferencedContent(err) => err.code(),
            GarbageCollectorError::DeleteUnwantedFiles(err) => err.code(),
        }
    }
}

async fn run_operator<I, O, Op>(operator: &Op, input: &I) -> Result<O, Op::Error>
where
    I: Send + Sync,
    O: Send,
    Op: Operator<I, O>,
{
    let name = operator.get_name();
    tracing::info!(operator = name, "Starting stage");
    let start = Instant::now();
    let result = operator.run(input).await;
    match &result {
        Ok(_) => tracing::info!(
            operator = name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished stage"
        ),
        Err(err) if err.should_trace_error() => tracing::error!(
            operator = name,
            code = err.code().name(),
            "Stage failed: {err}"
        ),
        Err(err) => tracing::warn!(operator = name, "Stage stopped: {err}"),
    }
    result
}

async fn stage_input(ctx: &GarbageCollectorContext) -> Result<StageInput, SqliteClockError> {
    Ok(StageInput {
        now: ctx.db.now().await?,
    })
}

/// Runs every stage not skipped by `options`, in dependency order. Each
/// stage commits its own work, so a failure leaves earlier stages done.
#[tracing::instrument(skip_all)]
pub async fn run_garbage_collection(
    ctx: &GarbageCollectorContext,
    options: &GarbageCollectionOptions,
) -> Result<GarbageCollectionReport, GarbageCollectorError> {
    let mut report = GarbageCollectionReport::default();
    let has_upstream = ctx.has_upstream();
    let policy = &ctx.policy;

    let clock = ConfirmNoClockSkewOperator::new(ctx.db.clone(), policy.max_clock_skew);
    run_operator(
        &clock,
        &ConfirmNoClockSkewInput {
            local_now: Utc::now(),
        },
    )
    .await?;

    if !options.skip_expiry {
        let operator = ExpireAliasesOperator::new(
            ctx.db.clone(),
            ctx.tuner(),
            policy.alias_expiry_grace,
        );
        report.expire_aliases = Some(run_operator(&operator, &stage_input(ctx).await?).await?);
    }

    if !options.skip_duplicates {
        let operator =
            MergeDuplicatesOperator::new(ctx.db.clone(), ctx.content_store(), has_upstream);
        report.merge_duplicates = Some(run_operator(&operator, &()).await?);
    }

    if !options.skip_blobs {
        let operator = DeleteExpiredBlobsOperator::new(ctx.db.clone());
        report.delete_expired_blobs =
            Some(run_operator(&operator, &stage_input(ctx).await?).await?);
    }

    if !options.skip_aliases {
        let operator = DeleteUnreferencedAliasesOperator::new(
            ctx.db.clone(),
            ctx.tuner(),
            policy.alias_expiry_grace,
            policy.min_alias_references,
        );
        report.delete_unreferenced_aliases =
            Some(run_operator(&operator, &stage_input(ctx).await?).await?);
    }

    if !options.skip_content {
        let operator = DeleteUnreferencedContentOperator::new(
            ctx.db.clone(),
            ctx.content_store(),
            ctx.tuner(),
            policy.deletion_concurrency,
            has_upstream,
        );
        report.delete_unreferenced_content = Some(run_operator(&operator, &()).await?);
    }

    if !options.skip_files {
        let operator = DeleteUnwantedFilesOperator::new(
            ctx.db.clone(),
            ctx.local.clone(),
            policy.orphan_file_grace,
            ctx.object_store().is_some(),
            has_upstream,
        );
        report.delete_unwanted_files =
            Some(run_operator(&operator, &stage_input(ctx).await?).await?);

        let operator = DeleteUnwantedObjectsOperator::new(
            ctx.db.clone(),
            ctx.object_store().cloned(),
            ctx.local.clone(),
            policy.orphan_file_grace,
            has_upstream,
        );
        report.delete_unwanted_objects =
            Some(run_operator(&operator, &stage_input(ctx).await?).await?);
    }

    Ok(report)
}
