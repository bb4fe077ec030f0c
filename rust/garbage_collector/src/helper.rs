use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use librarian_sqlite::db::test_utils::new_test_db;
use librarian_storage::{ContentId, LocalStorage, ObjectStore};
use tempfile::TempDir;

use crate::config::GcPolicyConfig;
use crate::context::GarbageCollectorContext;
use crate::feature_flags::{StaticFeatureFlags, OBJECT_STORE_ENABLED};

pub(crate) const DAY: i64 = 24 * 60 * 60;

/// A database, a storage root with its `incoming` directory, and an
/// in-memory object store.
pub(crate) struct TestLibrarian {
    _db_dir: TempDir,
    pub(crate) storage_dir: TempDir,
    pub(crate) remote: ObjectStore,
    pub(crate) ctx: GarbageCollectorContext,
}

impl TestLibrarian {
    pub(crate) async fn new() -> Self {
        Self::with_options(false, None).await
    }

    pub(crate) async fn with_options(object_store_enabled: bool, upstream_host: Option<&str>) -> Self {
        let (db_dir, db) = new_test_db().await;
        let storage_dir = TempDir::new().unwrap();
        std::fs::create_dir(storage_dir.path().join("incoming")).unwrap();
        let remote = ObjectStore::in_memory();
        let flags = StaticFeatureFlags::new(HashMap::new())
            .with(OBJECT_STORE_ENABLED, object_store_enabled);
        let policy = GcPolicyConfig {
            chunk_goal: Duration::from_millis(100),
            initial_chunk_size: 2,
            min_chunk_size: 1,
            ..GcPolicyConfig::default()
        };
        let ctx = GarbageCollectorContext::new(
            db,
            LocalStorage::new(storage_dir.path()),
            Some(remote.clone()),
            Arc::new(flags),
            policy,
            upstream_host.map(str::to_string),
        );
        TestLibrarian {
            _db_dir: db_dir,
            storage_dir,
            remote,
            ctx,
        }
    }

    pub(crate) async fn now(&self) -> i64 {
        self.ctx.db.now().await.unwrap().timestamp()
    }

    /// Writes `bytes` to disk and records a content row with their real hash.
    pub(crate) async fn add_content(&self, id: ContentId, bytes: &[u8], datecreated: i64) {
        self.ctx.local.put_bytes(id, bytes).await.unwrap();
        let (sha1, length) = self.ctx.content_store().hash_and_length(id).await.unwrap();
        self.add_content_row(id, &sha1, length as i64, datecreated)
            .await;
    }

    pub(crate) async fn add_content_row(&self, id: ContentId, sha1: &str, filesize: i64, datecreated: i64) {
        sqlx::query(
            "INSERT INTO library_file_content (id, datecreated, filesize, sha1) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(datecreated)
        .bind(filesize)
        .bind(sha1)
        .execute(self.ctx.db.get_conn())
        .await
        .unwrap();
    }

    pub(crate) async fn add_alias(
        &self,
        id: i64,
        content: Option<ContentId>,
        expires: Option<i64>,
        date_created: i64,
    ) {
        sqlx::query(
            "INSERT INTO library_file_alias (id, content, filename, mimetype, expires, date_created) \
             VALUES ($1, $2, $3, 'text/plain', $4, $5)",
        )
        .bind(id)
        .bind(content)
        .bind(format!("file-{id}.txt"))
        .bind(expires)
        .bind(date_created)
        .execute(self.ctx.db.get_conn())
        .await
        .unwrap();
    }

    /// `None` when the alias row is gone, `Some(content)` otherwise.
    pub(crate) async fn alias_content(&self, id: i64) -> Option<Option<ContentId>> {
        sqlx::query_scalar("SELECT content FROM library_file_alias WHERE id = $1")
            .bind(id)
            .fetch_optional(self.ctx.db.get_conn())
            .await
            .unwrap()
    }

    pub(crate) async fn content_row_exists(&self, id: ContentId) -> bool {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM library_file_content WHERE id = $1")
            .bind(id)
            .fetch_one(self.ctx.db.get_conn())
            .await
            .unwrap();
        count > 0
    }

    pub(crate) async fn execute(&self, sql: &str) {
        sqlx::raw_sql(sql)
            .execute(self.ctx.db.get_conn())
            .await
            .unwrap();
    }

    /// Backdates the modification time of a file under the storage root.
    pub(crate) fn age_file(&self, relative: &str, age: Duration) {
        let path = self.storage_dir.path().join(relative);
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    pub(crate) fn write_file(&self, relative: &str, bytes: &[u8]) {
        let path = self.storage_dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    pub(crate) fn file_exists(&self, relative: &str) -> bool {
        self.storage_dir.path().join(relative).exists()
    }
}
