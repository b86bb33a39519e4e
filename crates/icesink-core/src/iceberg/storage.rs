//! Object storage behind a data file prefix.
//!
//! The prefix is either an `s3://bucket/path` URL or a local directory. Keys
//! handed to [`Storage`] are relative to the prefix; [`Storage::location`]
//! renders the absolute location recorded in the catalog.

use crate::config::{PROP_S3_ACCESS_KEY_ID, PROP_S3_ENDPOINT, PROP_S3_REGION, PROP_S3_SECRET_ACCESS_KEY};
use crate::error::WriteError;
use crate::{Error, Result};
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::collections::HashMap;
use std::sync::Arc;

/// Object store rooted at a storage prefix.
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn ObjectStore>,
    /// Prefix as configured, without a trailing slash
    prefix: String,
    /// Path of the prefix inside the store
    root: String,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("prefix", &self.prefix)
            .field("root", &self.root)
            .finish()
    }
}

impl Storage {
    /// Open the store for `prefix`, using S3 settings from `properties`.
    pub fn open(prefix: &str, properties: &HashMap<String, String>) -> Result<Self> {
        let prefix = prefix.trim_end_matches('/').to_string();

        if let Some(rest) = prefix.strip_prefix("s3://") {
            let (bucket, root) = rest.split_once('/').unwrap_or((rest, ""));
            let store = create_s3_store(bucket, properties)?;
            Ok(Self {
                store,
                root: root.to_string(),
                prefix,
            })
        } else if prefix.contains("://") {
            Err(WriteError::UnsupportedStorage(prefix).into())
        } else {
            let store = create_local_store(&prefix)?;
            Ok(Self {
                store,
                root: String::new(),
                prefix,
            })
        }
    }

    /// Wrap an existing store.
    pub fn from_store(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            root: String::new(),
        }
    }

    /// Absolute location of `key`.
    pub fn location(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    /// Path of `key` inside the store.
    pub fn object_path(&self, key: &str) -> ObjectPath {
        if self.root.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.root, key))
        }
    }

    /// Key of an absolute location under this prefix.
    pub fn key_of(&self, location: &str) -> Option<String> {
        location
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    /// Configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Create (or replace) the object at `key`.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let object_path = self.object_path(key);
        let payload = PutPayload::from_bytes(data);

        self.store.put(&object_path, payload).await.map_err(|e| {
            Error::Write(WriteError::Upload {
                path: self.location(key),
                message: e.to_string(),
            })
        })?;

        Ok(())
    }

    /// Read the whole object at `key`.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let read_error = |e: object_store::Error| {
            Error::Write(WriteError::Read {
                path: self.location(key),
                message: e.to_string(),
            })
        };

        let result = self
            .store
            .get(&self.object_path(key))
            .await
            .map_err(read_error)?;
        result.bytes().await.map_err(read_error)
    }
}

fn create_s3_store(bucket: &str, properties: &HashMap<String, String>) -> Result<Arc<dyn ObjectStore>> {
    use object_store::aws::AmazonS3Builder;

    if bucket.is_empty() {
        return Err(Error::Config("Invalid S3 prefix: missing bucket".into()));
    }

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

    if let Some(region) = properties.get(PROP_S3_REGION) {
        builder = builder.with_region(region);
    }

    if let Some(access_key) = properties.get(PROP_S3_ACCESS_KEY_ID) {
        builder = builder.with_access_key_id(access_key);
    }

    if let Some(secret_key) = properties.get(PROP_S3_SECRET_ACCESS_KEY) {
        builder = builder.with_secret_access_key(secret_key);
    }

    if let Some(endpoint) = properties.get(PROP_S3_ENDPOINT) {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }

    let store = builder
        .build()
        .map_err(|e| WriteError::UnsupportedStorage(format!("s3://{}: {}", bucket, e)))?;

    Ok(Arc::new(store))
}

fn create_local_store(prefix: &str) -> Result<Arc<dyn ObjectStore>> {
    use object_store::local::LocalFileSystem;

    let path = std::path::Path::new(prefix);

    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| {
            WriteError::UnsupportedStorage(format!(
                "Failed to create local directory {}: {}",
                prefix, e
            ))
        })?;
    }

    let store = LocalFileSystem::new_with_prefix(path).map_err(|e| {
        WriteError::UnsupportedStorage(format!(
            "Failed to create local file system store: {}",
            e
        ))
    })?;

    Ok(Arc::new(store))
}
