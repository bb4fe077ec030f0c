use std::sync::Arc;

use async_trait::async_trait;
use librarian_config::Configurable;
use librarian_error::LibrarianError;
use librarian_sqlite::SqliteDb;
use librarian_storage::{ContentStore, LocalStorage, ObjectStore};

use crate::config::{GarbageCollectorConfig, GcPolicyConfig};
use crate::feature_flags::{FeatureFlags, StaticFeatureFlags, OBJECT_STORE_ENABLED};
use crate::loop_tuner::LoopTuner;

/// Everything a collection run talks to.
#[derive(Debug, Clone)]
pub struct GarbageCollectorContext {
    pub db: SqliteDb,
    pub local: LocalStorage,
    object_store: Option<ObjectStore>,
    feature_flags: Arc<dyn FeatureFlags>,
    pub policy: GcPolicyConfig,
    pub upstream_host: Option<String>,
}

impl GarbageCollectorContext {
    pub fn new(
        db: SqliteDb,
        local: LocalStorage,
        object_store: Option<ObjectStore>,
        feature_flags: Arc<dyn FeatureFlags>,
        policy: GcPolicyConfig,
        upstream_host: Option<String>,
    ) -> Self {
        GarbageCollectorContext {
            db,
            local,
            object_store,
            feature_flags,
            policy,
            upstream_host,
        }
    }

    /// The object store, if one is configured and the feature flag is on.
    pub fn object_store(&self) -> Option<&ObjectStore> {
        if self.feature_flags.is_enabled(OBJECT_STORE_ENABLED) {
            self.object_store.as_ref()
        } else {
            None
        }
    }

    pub fn content_store(&self) -> ContentStore {
        ContentStore::new(self.local.clone(), self.object_store().cloned())
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream_host.is_some()
    }

    pub fn tuner(&self) -> LoopTuner {
        LoopTuner::new(
            self.policy.chunk_goal,
            self.policy.initial_chunk_size,
            self.policy.min_chunk_size,
            self.policy.max_chunk_size,
        )
    }
}

#[async_trait]
impl Configurable<GarbageCollectorConfig> for GarbageCollectorContext {
    async fn try_from_config(
        config: &GarbageCollectorConfig,
    ) -> Result<Self, Box<dyn LibrarianError>> {
        let db = SqliteDb::try_from_config(&config.sqlite)
            .await
            .map_err(|err| err.boxed())?;
        let local = LocalStorage::try_from_config(&config.storage)
            .await
            .map_err(|err| err.boxed())?;
        let feature_flags = StaticFeatureFlags::new(config.feature_flags.clone());
        let object_store = match &config.storage.object_store {
            Some(object_store_config) => Some(
                ObjectStore::try_from_config(object_store_config)
                    .await
                    .map_err(|err| err.boxed())?,
            ),
            None => {
                if feature_flags.is_enabled(OBJECT_STORE_ENABLED) {
                    tracing::warn!(
                        "{} is set but no object store is configured; using disk only",
                        OBJECT_STORE_ENABLED
                    );
                }
                None
            }
        };
        Ok(GarbageCollectorContext::new(
            db,
            local,
            object_store,
            Arc::new(feature_flags),
            config.policy.clone(),
            config.upstream_host.clone(),
        ))
    }
}
