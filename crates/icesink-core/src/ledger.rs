//! Per-writer ledger of data files awaiting commit.
//!
//! A writer appends the path of every file it produces and publishes the list
//! to the shared state store, where the leader picks it up. State keys:
//!
//! - streaming: `streaming_files_{namespace.table}_{worker}`
//! - snapshot: `files_for_{worker}`
//! - acknowledgement: `consumed_files_{namespace.table}_{worker}`
//!
//! Values are JSON arrays of path strings.
//!
//! The leader writes the acknowledgement key with the exact list it committed
//! before removing a streaming key. A writer drops a published path from its
//! ledger only once the path is gone from its streaming key and listed in its
//! acknowledgement, so files recorded while the leader was clearing are
//! published again instead of lost.

use crate::error::StateStoreError;
use crate::event::TableIdent;
use crate::state::StateStore;
use crate::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Key prefix of streaming ledger entries.
pub const STREAMING_KEY_PREFIX: &str = "streaming_files_";

/// Key prefix of snapshot ledger entries.
pub const SNAPSHOT_KEY_PREFIX: &str = "files_for_";

/// Key prefix of committed-file acknowledgements.
pub const CONSUMED_KEY_PREFIX: &str = "consumed_files_";

/// State key of one writer's streaming files for `table`.
pub fn streaming_key(table: &TableIdent, worker: u32) -> String {
    format!("{}{}_{}", STREAMING_KEY_PREFIX, table, worker)
}

/// Table and worker of a streaming state key.
///
/// The worker id follows the last underscore, so table names may contain
/// underscores.
pub fn parse_streaming_key(key: &str) -> Option<(TableIdent, String)> {
    split_table_key(key, STREAMING_KEY_PREFIX)
}

/// State key acknowledging the files committed from one writer's streaming key.
pub fn consumed_key(table: &TableIdent, worker: u32) -> String {
    format!("{}{}_{}", CONSUMED_KEY_PREFIX, table, worker)
}

/// Acknowledgement key paired with a streaming key.
pub fn consumed_key_of(streaming_key: &str) -> Option<String> {
    let rest = streaming_key.strip_prefix(STREAMING_KEY_PREFIX)?;
    Some(format!("{}{}", CONSUMED_KEY_PREFIX, rest))
}

/// Table and worker of an acknowledgement key.
pub fn parse_consumed_key(key: &str) -> Option<(TableIdent, String)> {
    split_table_key(key, CONSUMED_KEY_PREFIX)
}

fn split_table_key(key: &str, prefix: &str) -> Option<(TableIdent, String)> {
    let rest = key.strip_prefix(prefix)?;
    let (table, worker) = rest.rsplit_once('_')?;
    if worker.is_empty() {
        return None;
    }
    Some((TableIdent::parse(table)?, worker.to_string()))
}

/// State key of one writer's snapshot files.
pub fn snapshot_key(worker: u32) -> String {
    format!("{}{}", SNAPSHOT_KEY_PREFIX, worker)
}

/// Decode a stored path list.
pub fn paths_from_value(key: &str, value: &serde_json::Value) -> Result<Vec<String>> {
    serde_json::from_value(value.clone()).map_err(|e| {
        StateStoreError::Malformed {
            key: key.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Read a path list, treating a missing or malformed value as empty.
async fn stored_paths(store: &dyn StateStore, scope: &str, key: &str) -> Result<Vec<String>> {
    let Some(value) = store.get_value(scope, key).await? else {
        return Ok(Vec::new());
    };
    Ok(paths_from_value(key, &value).unwrap_or_else(|e| {
        warn!(key = %key, error = %e, "Ignoring malformed state entry");
        Vec::new()
    }))
}

#[derive(Debug, Default)]
struct LedgerState {
    seq: u64,
    files: BTreeMap<TableIdent, Vec<String>>,
    /// Last list written to each table's streaming key
    published: BTreeMap<TableIdent, BTreeSet<String>>,
}

impl LedgerState {
    /// Drop published paths the leader acknowledged and removed.
    ///
    /// The first sync of a table adopts paths left in the store by an earlier
    /// run of this writer.
    fn sync(&mut self, table: &TableIdent, current: Vec<String>, acked: Vec<String>) -> usize {
        let first = !self.published.contains_key(table);
        let current_set: HashSet<&String> = current.iter().collect();
        let acked: HashSet<String> = acked.into_iter().collect();

        let consumed: HashSet<String> = self
            .published
            .get(table)
            .map(|published| {
                published
                    .iter()
                    .filter(|p| !current_set.contains(p) && acked.contains(*p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let files = self.files.entry(table.clone()).or_default();
        let before = files.len();
        files.retain(|p| !consumed.contains(p));
        let pruned = before - files.len();

        if first {
            for path in current {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        if files.is_empty() {
            self.files.remove(table);
        }
        pruned
    }
}

/// File paths produced by this writer since the last commit.
#[derive(Debug, Default)]
pub struct WriterFileLedger {
    state: Mutex<LedgerState>,
}

impl WriterFileLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next file sequence number, starting at 1.
    pub fn next_seq(&self) -> u64 {
        let mut state = self.state.lock();
        state.seq += 1;
        state.seq
    }

    /// Append a produced file.
    pub fn record(&self, table: &TableIdent, path: impl Into<String>) {
        self.state
            .lock()
            .files
            .entry(table.clone())
            .or_default()
            .push(path.into());
    }

    /// Paths recorded for `table`.
    pub fn paths(&self, table: &TableIdent) -> Vec<String> {
        self.state
            .lock()
            .files
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Paths recorded across all tables, ordered by table.
    pub fn all_paths(&self) -> Vec<String> {
        self.state.lock().files.values().flatten().cloned().collect()
    }

    /// Tables with recorded paths.
    pub fn tables(&self) -> Vec<TableIdent> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Forget the given paths of `table`, keeping any recorded since.
    pub fn forget(&self, table: &TableIdent, paths: &[String]) {
        let gone: HashSet<&String> = paths.iter().collect();
        let mut state = self.state.lock();
        let emptied = state.files.get_mut(table).is_some_and(|files| {
            files.retain(|p| !gone.contains(p));
            files.is_empty()
        });
        if emptied {
            state.files.remove(table);
        }
        if let Some(published) = state.published.get_mut(table) {
            published.retain(|p| !gone.contains(p));
        }
    }

    /// Forget the paths of `table`.
    pub fn reset(&self, table: &TableIdent) {
        let mut state = self.state.lock();
        state.files.remove(table);
        state.published.remove(table);
    }

    /// Forget every recorded path.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.files.clear();
        state.published.clear();
    }

    /// Publish this writer's paths for `table` under its streaming key.
    ///
    /// Paths the leader has committed and acknowledged are dropped first; the
    /// rest, including files whose entry was removed before they were
    /// committed, are published again.
    pub async fn persist_streaming(
        &self,
        store: &dyn StateStore,
        scope: &str,
        table: &TableIdent,
        worker: u32,
    ) -> Result<()> {
        let key = streaming_key(table, worker);
        let current = stored_paths(store, scope, &key).await?;
        let acked = stored_paths(store, scope, &consumed_key(table, worker)).await?;

        let (paths, pruned) = {
            let mut state = self.state.lock();
            let pruned = state.sync(table, current, acked);
            let paths = state.files.get(table).cloned().unwrap_or_default();
            (paths, pruned)
        };
        debug!(key = %key, files = paths.len(), pruned, "Persisting streaming ledger");

        let mut state = HashMap::with_capacity(1);
        state.insert(key, serde_json::json!(paths));
        store.set_state(scope, state).await?;

        self.state
            .lock()
            .published
            .insert(table.clone(), paths.into_iter().collect());
        Ok(())
    }

    /// Publish every path of this writer under its snapshot key.
    pub async fn persist_snapshot(
        &self,
        store: &dyn StateStore,
        scope: &str,
        worker: u32,
    ) -> Result<()> {
        let paths = self.all_paths();
        let key = snapshot_key(worker);
        debug!(key = %key, files = paths.len(), "Persisting snapshot ledger");

        let mut state = HashMap::with_capacity(1);
        state.insert(key, serde_json::json!(paths));
        store.set_state(scope, state).await
    }
}
