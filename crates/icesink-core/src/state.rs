//! Shared state store.
//!
//! Writers publish their uncommitted file lists here so the leader can commit
//! them. Every key lives under a scope (the transfer id); values are JSON.
//!
//! Two implementations:
//! - [`MemoryStateStore`]: process-local map for single-process runs and tests
//! - [`ObjectStoreStateStore`]: one JSON object per key at
//!   `<root>/<scope>/<key>.json`, visible to every process sharing the bucket

use crate::config::{Config, StateStoreKind};
use crate::error::StateStoreError;
use crate::iceberg::storage::Storage;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::PutPayload;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Key/value state shared between writer processes.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create or replace the given keys.
    async fn set_state(&self, scope: &str, state: HashMap<String, serde_json::Value>) -> Result<()>;

    /// Read every key of the scope.
    async fn get_state(&self, scope: &str) -> Result<HashMap<String, serde_json::Value>>;

    /// Read one key.
    async fn get_value(&self, scope: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get_state(scope).await?.remove(key))
    }

    /// Delete the given keys. Missing keys are ignored.
    async fn remove_state(&self, scope: &str, keys: &[String]) -> Result<()>;
}

/// Create the state store selected by configuration.
pub fn open_state_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    match config.state.kind {
        StateStoreKind::Memory => Ok(Arc::new(MemoryStateStore::new())),
        StateStoreKind::ObjectStore => {
            let location = config.state.path.clone().unwrap_or_else(|| {
                format!(
                    "{}/_icesink_state",
                    config.destination.prefix.trim_end_matches('/')
                )
            });
            info!(location = %location, "Using object store state");
            let storage = Storage::open(&location, &config.destination.properties)?;
            Ok(Arc::new(ObjectStoreStateStore::new(storage)))
        }
    }
}

/// In-process state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    scopes: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held for a scope.
    pub fn len(&self, scope: &str) -> usize {
        self.scopes.read().get(scope).map_or(0, HashMap::len)
    }

    /// Whether the scope holds no keys.
    pub fn is_empty(&self, scope: &str) -> bool {
        self.len(scope) == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn set_state(&self, scope: &str, state: HashMap<String, serde_json::Value>) -> Result<()> {
        self.scopes
            .write()
            .entry(scope.to_string())
            .or_default()
            .extend(state);
        Ok(())
    }

    async fn get_state(&self, scope: &str) -> Result<HashMap<String, serde_json::Value>> {
        Ok(self.scopes.read().get(scope).cloned().unwrap_or_default())
    }

    async fn get_value(&self, scope: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .scopes
            .read()
            .get(scope)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn remove_state(&self, scope: &str, keys: &[String]) -> Result<()> {
        if let Some(entries) = self.scopes.write().get_mut(scope) {
            for key in keys {
                entries.remove(key);
            }
        }
        Ok(())
    }
}

const STATE_SUFFIX: &str = ".json";

/// State store keeping one JSON object per key in object storage.
#[derive(Debug, Clone)]
pub struct ObjectStoreStateStore {
    storage: Storage,
}

impl ObjectStoreStateStore {
    /// Create a store rooted at `storage`.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn key_location(scope: &str, key: &str) -> String {
        format!("{}/{}{}", scope, key, STATE_SUFFIX)
    }
}

#[async_trait]
impl StateStore for ObjectStoreStateStore {
    async fn set_state(&self, scope: &str, state: HashMap<String, serde_json::Value>) -> Result<()> {
        let store = self.storage.store();

        for (key, value) in state {
            let body = serde_json::to_vec(&value)?;
            let path = self.storage.object_path(&Self::key_location(scope, &key));
            store
                .put(&path, PutPayload::from_bytes(Bytes::from(body)))
                .await
                .map_err(|e| StateStoreError::Set {
                    scope: scope.to_string(),
                    message: format!("{}: {}", key, e),
                })?;
            debug!(scope = %scope, key = %key, "Stored state");
        }

        Ok(())
    }

    async fn get_state(&self, scope: &str) -> Result<HashMap<String, serde_json::Value>> {
        let store = self.storage.store();
        let get_error = |message: String| StateStoreError::Get {
            scope: scope.to_string(),
            message,
        };

        let scope_path = self.storage.object_path(scope);
        let objects: Vec<_> = store
            .list(Some(&scope_path))
            .try_collect()
            .await
            .map_err(|e| get_error(e.to_string()))?;

        let mut state = HashMap::with_capacity(objects.len());
        for meta in objects {
            let Some(key) = meta
                .location
                .filename()
                .and_then(|name| name.strip_suffix(STATE_SUFFIX))
                .map(str::to_string)
            else {
                continue;
            };

            let data = match store.get(&meta.location).await {
                Ok(result) => result.bytes().await.map_err(|e| get_error(e.to_string()))?,
                // removed between list and get
                Err(object_store::Error::NotFound { .. }) => continue,
                Err(e) => return Err(get_error(e.to_string()).into()),
            };

            let value: serde_json::Value =
                serde_json::from_slice(&data).map_err(|e| StateStoreError::Malformed {
                    key: key.clone(),
                    message: e.to_string(),
                })?;
            state.insert(key, value);
        }

        Ok(state)
    }

    async fn get_value(&self, scope: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.storage.object_path(&Self::key_location(scope, key));
        let data = match self.storage.store().get(&path).await {
            Ok(result) => result.bytes().await,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => Err(e),
        }
        .map_err(|e| StateStoreError::Get {
            scope: scope.to_string(),
            message: format!("{}: {}", key, e),
        })?;

        let value = serde_json::from_slice(&data).map_err(|e| StateStoreError::Malformed {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(value))
    }

    async fn remove_state(&self, scope: &str, keys: &[String]) -> Result<()> {
        let store = self.storage.store();

        for key in keys {
            let path = self.storage.object_path(&Self::key_location(scope, key));
            match store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => {
                    return Err(StateStoreError::Remove {
                        scope: scope.to_string(),
                        message: format!("{}: {}", key, e),
                    }
                    .into())
                }
            }
        }

        debug!(scope = %scope, keys = keys.len(), "Removed state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entries(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn exercise(store: &dyn StateStore) {
        store
            .set_state(
                "transfer-1",
                entries(&[
                    ("streaming_files_db.t_0", json!(["a.parquet"])),
                    ("streaming_files_db.t_1", json!(["b.parquet"])),
                ]),
            )
            .await
            .unwrap();
        store
            .set_state("transfer-2", entries(&[("files_for_0", json!(["c.parquet"]))]))
            .await
            .unwrap();

        let state = store.get_state("transfer-1").await.unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state["streaming_files_db.t_1"], json!(["b.parquet"]));
        assert_eq!(
            store.get_value("transfer-1", "streaming_files_db.t_1").await.unwrap(),
            Some(json!(["b.parquet"]))
        );
        assert_eq!(store.get_value("transfer-1", "missing").await.unwrap(), None);
        assert_eq!(store.get_value("unknown", "files_for_0").await.unwrap(), None);

        // replace
        store
            .set_state(
                "transfer-1",
                entries(&[("streaming_files_db.t_0", json!(["a.parquet", "d.parquet"]))]),
            )
            .await
            .unwrap();
        let state = store.get_state("transfer-1").await.unwrap();
        assert_eq!(state["streaming_files_db.t_0"], json!(["a.parquet", "d.parquet"]));

        store
            .remove_state(
                "transfer-1",
                &["streaming_files_db.t_0".to_string(), "missing".to_string()],
            )
            .await
            .unwrap();
        let state = store.get_state("transfer-1").await.unwrap();
        assert_eq!(state.len(), 1);
        assert!(state.contains_key("streaming_files_db.t_1"));

        assert_eq!(store.get_state("transfer-2").await.unwrap().len(), 1);
        assert!(store.get_state("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        exercise(&store).await;
        assert_eq!(store.len("transfer-1"), 1);
        assert!(store.is_empty("unknown"));
    }

    #[tokio::test]
    async fn test_object_store_state() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path().to_str().unwrap(), &HashMap::new()).unwrap();
        let store = ObjectStoreStateStore::new(storage);

        exercise(&store).await;
        assert!(temp_dir
            .path()
            .join("transfer-1/streaming_files_db.t_1.json")
            .exists());
    }

    #[tokio::test]
    async fn test_object_store_malformed_value() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("scope")).unwrap();
        std::fs::write(temp_dir.path().join("scope/bad.json"), b"{not json").unwrap();

        let storage = Storage::open(temp_dir.path().to_str().unwrap(), &HashMap::new()).unwrap();
        let store = ObjectStoreStateStore::new(storage);
        let err = store.get_state("scope").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::StateStore(StateStoreError::Malformed { .. })
        ));
    }

    #[test]
    fn test_open_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::local(temp_dir.path().to_str().unwrap());
        assert!(open_state_store(&config).is_ok());

        config.state.kind = StateStoreKind::ObjectStore;
        assert!(open_state_store(&config).is_ok());
        assert!(temp_dir.path().join("_icesink_state").exists());
    }
}
