use std::collections::HashMap;
use std::fmt::Debug;

/// Gates the object store backend. With it off, only the disk is consulted.
pub const OBJECT_STORE_ENABLED: &str = "librarian.object_store.enabled";

pub trait FeatureFlags: Debug + Send + Sync {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Flags fixed for the lifetime of the process, read from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureFlags {
    flags: HashMap<String, bool>,
}

impl StaticFeatureFlags {
    pub fn new(flags: HashMap<String, bool>) -> Self {
        StaticFeatureFlags { flags }
    }

    pub fn with(mut self, flag: &str, enabled: bool) -> Self {
        self.flags.insert(flag.to_string(), enabled);
        self
    }
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled(&self, flag: &str) -> bool {
        self.flags.get(flag).copied().unwrap_or(false)
    }
}
