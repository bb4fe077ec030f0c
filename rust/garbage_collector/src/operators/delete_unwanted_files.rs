use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use librarian_error::{ErrorCodes, LibrarianError};
use librarian_sqlite::SqliteDb;
use librarian_storage::location::{
    content_id_from_object_name, content_id_from_relative_path, is_storage_directory_name,
    CONTAINER_SIZE, MAX_DISK_CONTENT_ID,
};
use librarian_storage::{ContentId, LocalStorage, ObjectStore, StorageError, StoredObject};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

use super::{cutoff_timestamp, Operator, StageInput};
use crate::reconcile::{KnownIds, Reconciler};

/// Entries at the top of the storage root that are not content.
const IGNORED_ROOT_ENTRIES: [&str; 4] = ["incoming", "lost+found", "librarian.pid", "librarian.log"];

/// Known ids read per query while sweeping.
const KNOWN_CONTENT_PAGE_SIZE: usize = 1000;

/// Content ids in the database up to `ceiling`, one short query per page.
#[derive(Clone, Debug)]
pub struct KnownContent {
    db: SqliteDb,
    ceiling: ContentId,
}

impl KnownContent {
    pub fn new(db: SqliteDb, ceiling: ContentId) -> Self {
        KnownContent { db, ceiling }
    }
}

#[async_trait]
impl KnownIds for KnownContent {
    type Error = sqlx::Error;

    async fn page_after(
        &mut self,
        after: Option<ContentId>,
        limit: usize,
    ) -> Result<Vec<ContentId>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT id FROM library_file_content
            WHERE id > $1 AND id <= $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(after.unwrap_or(ContentId::MIN))
        .bind(self.ceiling)
        .bind(limit as i64)
        .fetch_all(self.db.get_conn())
        .await
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteUnwantedFilesOutput {
    pub seen: u64,
    pub ignored: u64,
    pub deleted: u64,
    pub too_young: u64,
    pub content_missing: u64,
}

#[derive(Error, Debug)]
pub enum DeleteUnwantedFilesError {
    #[error("Error reading known content: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} is not a directory, refusing to sweep this storage root")]
    MissingIncoming(PathBuf),
    #[error("Error walking storage root: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LibrarianError for DeleteUnwantedFilesError {
    fn code(&self) -> ErrorCodes {
        match self {
            DeleteUnwantedFilesError::Database(_) => ErrorCodes::Internal,
            DeleteUnwantedFilesError::MissingIncoming(_) => ErrorCodes::FailedPrecondition,
            DeleteUnwantedFilesError::Walk(err) => err
                .io_error()
                .map(|io| io.kind().into())
                .unwrap_or(ErrorCodes::Internal),
            DeleteUnwantedFilesError::Io { source, .. } => source.code(),
            DeleteUnwantedFilesError::Storage(err) => err.code(),
        }
    }
}

fn keep_entry(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if entry.depth() == 1 && IGNORED_ROOT_ENTRIES.contains(&name.as_ref()) {
        return false;
    }
    if entry.file_type().is_dir() && !is_storage_directory_name(&name) {
        tracing::warn!("Ignoring unexpected directory {}", entry.path().display());
        return false;
    }
    true
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

/// Deletes files under the storage root that the database does not know
/// about, once they are older than the grace period.
#[derive(Clone, Debug)]
pub struct DeleteUnwantedFilesOperator {
    db: SqliteDb,
    local: LocalStorage,
    grace: Duration,
    /// Content missing from disk is only reported when disk is the sole copy.
    report_missing: bool,
}

impl DeleteUnwantedFilesOperator {
    pub fn new(
        db: SqliteDb,
        local: LocalStorage,
        grace: Duration,
        object_store_enabled: bool,
        has_upstream: bool,
    ) -> Self {
        Self {
            db,
            local,
            grace,
            report_missing: !object_store_enabled && !has_upstream,
        }
    }

    fn report_missing(&self, missing: &[ContentId], output: &mut DeleteUnwantedFilesOutput) {
        if !self.report_missing {
            return;
        }
        for content_id in missing {
            output.content_missing += 1;
            tracing::error!(
                content_id,
                path = %self.local.path_for(*content_id).display(),
                "Content is in the database but missing from disk"
            );
        }
    }

    fn modified_timestamp(path: &Path) -> Result<Option<i64>, DeleteUnwantedFilesError> {
        match std::fs::metadata(path).and_then(|metadata| metadata.modified()) {
            Ok(modified) => Ok(Some(DateTime::<Utc>::from(modified).timestamp())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(DeleteUnwantedFilesError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Operator<StageInput, DeleteUnwantedFilesOutput> for DeleteUnwantedFilesOperator {
    type Error = DeleteUnwantedFilesError;

    fn get_name(&self) -> &'static str {
        "delete_unwanted_files"
    }

    async fn run(&self, input: &StageInput) -> Result<DeleteUnwantedFilesOutput, DeleteUnwantedFilesError> {
        let root = self.local.root();
        let incoming = root.join("incoming");
        if !incoming.is_dir() {
            return Err(DeleteUnwantedFilesError::MissingIncoming(incoming));
        }
        let cutoff = cutoff_timestamp(input.now, self.grace);
        let mut output = DeleteUnwantedFilesOutput::default();
        // Larger ids have no place on disk.
        let mut reconciler = Reconciler::new(
            KnownContent::new(self.db.clone(), MAX_DISK_CONTENT_ID),
            KNOWN_CONTENT_PAGE_SIZE,
        );

        // Lowercase fixed width hex sorts by name in id order. Symlinks are
        // not followed, so a link loop is just another unexpected file.
        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep_entry);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if is_not_found(&err) => {
                    tracing::debug!("Entry vanished during walk: {err}");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let content_id = entry
                .path()
                .strip_prefix(root)
                .ok()
                .and_then(content_id_from_relative_path);
            let Some(content_id) = content_id else {
                tracing::warn!("Ignoring unexpected file {}", entry.path().display());
                output.ignored += 1;
                continue;
            };
            output.seen += 1;

            let classification = reconciler.classify(content_id).await?;
            self.report_missing(&classification.missing, &mut output);
            if classification.wanted {
                continue;
            }

            let Some(modified) = Self::modified_timestamp(entry.path())? else {
                continue;
            };
            if modified >= cutoff {
                tracing::debug!(content_id, "Keeping recent unwanted file");
                output.too_young += 1;
                continue;
            }
            if self.local.remove_path(entry.path()).await? {
                tracing::info!(
                    content_id,
                    path = %entry.path().display(),
                    "Deleted unwanted file"
                );
                output.deleted += 1;
            }
        }
        while let Some(content_id) = reconciler.next_missing().await? {
            self.report_missing(&[content_id], &mut output);
        }

        tracing::info!(
            seen = output.seen,
            deleted = output.deleted,
            too_young = output.too_young,
            content_missing = output.content_missing,
            "Swept storage root"
        );
        Ok(output)
    }
}

/// Deletes objects the database does not know about, once they are older
/// than the grace period. Does nothing while the object store is disabled.
#[derive(Clone, Debug)]
pub struct DeleteUnwantedObjectsOperator {
    db: SqliteDb,
    object_store: Option<ObjectStore>,
    local: LocalStorage,
    grace: Duration,
    has_upstream: bool,
}

impl DeleteUnwantedObjectsOperator {
    pub fn new(
        db: SqliteDb,
        object_store: Option<ObjectStore>,
        local: LocalStorage,
        grace: Duration,
        has_upstream: bool,
    ) -> Self {
        Self {
            db,
            object_store,
            local,
            grace,
            has_upstream,
        }
    }

    /// Content still on disk is waiting to be migrated, not missing.
    async fn report_missing(
        &self,
        missing: &[ContentId],
        output: &mut DeleteUnwantedFilesOutput,
    ) -> Result<(), DeleteUnwantedFilesError> {
        if self.has_upstream {
            return Ok(());
        }
        for content_id in missing {
            if self.local.exists(*content_id).await? {
                continue;
            }
            output.content_missing += 1;
            tracing::error!(
                content_id,
                "Content is in the database but missing from the object store and disk"
            );
        }
        Ok(())
    }

    async fn list_container(
        &self,
        store: &ObjectStore,
        index: ContentId,
        container: &str,
        output: &mut DeleteUnwantedFilesOutput,
    ) -> Result<Vec<(ContentId, StoredObject)>, DeleteUnwantedFilesError> {
        let mut objects = Vec::new();
        for object in store.list_container(container).await? {
            match content_id_from_object_name(&object.name) {
                Some(content_id) if content_id / CONTAINER_SIZE == index => {
                    objects.push((content_id, object))
                }
                _ => {
                    tracing::warn!("Ignoring unexpected object {}/{}", container, object.name);
                    output.ignored += 1;
                }
            }
        }
        objects.sort_by(|(a_id, a), (b_id, b)| a_id.cmp(b_id).then_with(|| a.name.cmp(&b.name)));
        Ok(objects)
    }
}

#[async_trait]
impl Operator<StageInput, DeleteUnwantedFilesOutput> for DeleteUnwantedObjectsOperator {
    type Error = DeleteUnwantedFilesError;

    fn get_name(&self) -> &'static str {
        "delete_unwanted_objects"
    }

    async fn run(&self, input: &StageInput) -> Result<DeleteUnwantedFilesOutput, DeleteUnwantedFilesError> {
        let mut output = DeleteUnwantedFilesOutput::default();
        let Some(store) = &self.object_store else {
            tracing::info!("Object store is disabled, skipping object sweep");
            return Ok(output);
        };
        let cutoff = cutoff_timestamp(input.now, self.grace);
        let mut reconciler = Reconciler::new(
            KnownContent::new(self.db.clone(), ContentId::MAX),
            KNOWN_CONTENT_PAGE_SIZE,
        );

        for (index, container) in store.list_containers().await? {
            let objects = self
                .list_container(store, index, &container, &mut output)
                .await?;
            for (content_id, object) in objects {
                output.seen += 1;
                let classification = reconciler.classify(content_id).await?;
                self.report_missing(&classification.missing, &mut output)
                    .await?;
                if classification.wanted {
                    continue;
                }
                if object.last_modified.timestamp() >= cutoff {
                    tracing::debug!(content_id, name = %object.name, "Keeping recent unwanted object");
                    output.too_young += 1;
                    continue;
                }
                if store.delete_object(&container, &object.name).await? {
                    tracing::info!(
                        content_id,
                        container = %container,
                        name = %object.name,
                        "Deleted unwanted object"
                    );
                    output.deleted += 1;
                }
            }
        }
        while let Some(content_id) = reconciler.next_missing().await? {
            self.report_missing(&[content_id], &mut output).await?;
        }

        tracing::info!(
            seen = output.seen,
            deleted = output.deleted,
            too_young = output.too_young,
            content_missing = output.content_missing,
            "Swept object store"
        );
        Ok(output)
    }
}
