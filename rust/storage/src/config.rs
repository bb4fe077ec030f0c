use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
/// The configuration for content storage.
/// # Fields
/// - root: The directory content files live under. It must contain an
///   `incoming` directory, which the disk sweep checks before deleting anything.
/// - object_store: The object store content is migrated to, if any. Whether it
///   is consulted is decided at runtime by a feature flag.
pub struct StorageConfig {
    pub root: String,
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub enum ObjectStoreConfig {
    // case-insensitive
    #[serde(alias = "s3")]
    S3(S3ObjectStoreConfig),
    #[serde(alias = "memory")]
    Memory,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_concurrent_requests() -> usize {
    30
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// An S3 compatible store. Swift deployments expose one through their S3 middleware.
/// Credentials come from the usual `AWS_*` environment variables.
pub struct S3ObjectStoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_storage_config() {
        let config: StorageConfig = serde_json::from_str(
            r#"{
                "root": "/srv/librarian",
                "object_store": {"s3": {"bucket": "librarian", "endpoint": "http://swift:8080", "allow_http": true}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.root, "/srv/librarian");
        match config.object_store {
            Some(ObjectStoreConfig::S3(s3)) => {
                assert_eq!(s3.bucket, "librarian");
                assert_eq!(s3.region, "us-east-1");
                assert_eq!(s3.endpoint.as_deref(), Some("http://swift:8080"));
                assert_eq!(s3.max_concurrent_requests, 30);
            }
            other => panic!("unexpected object store config {other:?}"),
        }

        let config: StorageConfig = serde_json::from_str(r#"{"root": "/srv/librarian"}"#).unwrap();
        assert!(config.object_store.is_none());
    }
}
