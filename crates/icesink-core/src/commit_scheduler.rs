//! Periodic cross-writer commit.
//!
//! Runs on the leader writer only. Every interval it:
//! 1. Aggregates the `streaming_files_*` entries of all writers from the shared state store
//! 2. Commits each table's files in one transaction
//! 3. Acknowledges and removes the entries whose files are all committed
//!
//! A failed table keeps its state entries and is retried on the next interval.
//! An entry a writer rewrote with new files since aggregation is left for the
//! next interval as well. Paths this scheduler already committed are filtered
//! out, since writers keep re-publishing their list until they see the
//! acknowledgement. The committed set only holds paths still listed in some
//! writer's entry or acknowledgement.

use crate::config::Config;
use crate::event::TableIdent;
use crate::iceberg::catalog::{CatalogOperations, CommitResult, TableInfo, Transaction};
use crate::ledger::{
    consumed_key_of, parse_consumed_key, parse_streaming_key, paths_from_value, streaming_key,
    WriterFileLedger, CONSUMED_KEY_PREFIX, STREAMING_KEY_PREFIX,
};
use crate::retry::RetryPolicy;
use crate::state::StateStore;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commit progress of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// Waiting for the next interval
    Idle,
    /// Collecting writer entries
    Aggregating,
    /// Transaction in flight
    Committing,
    /// Removing consumed state entries
    Clearing,
}

/// Outcome of one commit pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub tables_committed: usize,
    pub tables_failed: usize,
    pub files_committed: usize,
}

/// Files of one table gathered from the state store.
#[derive(Debug, Default)]
struct PendingTable {
    files: BTreeSet<String>,
    keys: Vec<String>,
}

/// Writer entries and acknowledgements read in one pass.
#[derive(Debug, Default)]
struct Aggregate {
    pending: BTreeMap<TableIdent, PendingTable>,
    acked: HashMap<TableIdent, HashSet<String>>,
}

/// Background committer for the leader writer.
pub struct CommitScheduler {
    catalog: Arc<dyn CatalogOperations>,
    state_store: Arc<dyn StateStore>,
    ledger: Option<Arc<WriterFileLedger>>,
    worker: u32,
    scope: String,
    interval: Duration,
    snapshot_props: HashMap<String, String>,
    retry: RetryPolicy,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    table_states: RwLock<BTreeMap<TableIdent, CommitState>>,
    committed: Mutex<HashMap<TableIdent, HashSet<String>>>,
    /// Serializes passes from the timer and from callers
    pass_lock: tokio::sync::Mutex<()>,
}

/// Builder for CommitScheduler.
pub struct CommitSchedulerBuilder {
    catalog: Option<Arc<dyn CatalogOperations>>,
    state_store: Option<Arc<dyn StateStore>>,
    ledger: Option<Arc<WriterFileLedger>>,
    worker: u32,
    scope: String,
    interval: Duration,
    snapshot_props: HashMap<String, String>,
    retry: RetryPolicy,
}

impl Default for CommitSchedulerBuilder {
    fn default() -> Self {
        Self {
            catalog: None,
            state_store: None,
            ledger: None,
            worker: 0,
            scope: "default".to_string(),
            interval: Duration::from_secs(60),
            snapshot_props: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl CommitSchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take worker, scope, interval, snapshot properties and retry settings from configuration.
    pub fn config(self, config: &Config) -> Self {
        self.worker(config.worker.index)
            .scope(config.worker.transfer_id.clone())
            .interval(config.destination.commit_interval())
            .snapshot_props(config.destination.snapshot_props.clone())
            .retry(RetryPolicy::from(&config.retry))
    }

    pub fn catalog(mut self, catalog: Arc<dyn CatalogOperations>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn state_store(mut self, state_store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(state_store);
        self
    }

    /// Ledger of the local writer, pruned as its files are committed.
    pub fn ledger(mut self, ledger: Arc<WriterFileLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Index of the local writer owning the ledger.
    pub fn worker(mut self, worker: u32) -> Self {
        self.worker = worker;
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn snapshot_props(mut self, props: HashMap<String, String>) -> Self {
        self.snapshot_props = props;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<CommitScheduler> {
        let catalog = self
            .catalog
            .ok_or_else(|| Error::Config("CommitScheduler requires a catalog".into()))?;
        let state_store = self
            .state_store
            .ok_or_else(|| Error::Config("CommitScheduler requires a state store".into()))?;
        if self.interval.is_zero() {
            return Err(Error::Config("commit interval must be greater than zero".into()));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(CommitScheduler {
            catalog,
            state_store,
            ledger: self.ledger,
            worker: self.worker,
            scope: self.scope,
            interval: self.interval,
            snapshot_props: self.snapshot_props,
            retry: self.retry,
            shutdown_tx,
            handle: Mutex::new(None),
            table_states: RwLock::new(BTreeMap::new()),
            committed: Mutex::new(HashMap::new()),
            pass_lock: tokio::sync::Mutex::new(()),
        })
    }
}

impl CommitScheduler {
    pub fn builder() -> CommitSchedulerBuilder {
        CommitSchedulerBuilder::new()
    }

    /// State scope the scheduler reads.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Current commit state of every table seen so far.
    pub fn table_states(&self) -> BTreeMap<TableIdent, CommitState> {
        self.table_states.read().clone()
    }

    /// Drop what is known about `table` after it was dropped or truncated.
    ///
    /// Waits for a pass in flight.
    pub async fn forget_table(&self, table: &TableIdent) {
        let _pass = self.pass_lock.lock().await;
        self.committed.lock().remove(table);
        self.table_states.write().remove(table);
    }

    /// Whether the background task is running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the interval loop. Calling it again while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.interval;

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.run_once().await {
                            warn!(error = %e, "Commit cycle skipped");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Commit scheduler received shutdown signal");
                        break;
                    }
                }
            }

            if let Err(e) = scheduler.run_once().await {
                error!(error = %e, "Final commit pass failed");
            }
        }));

        info!(
            scope = %self.scope,
            interval_secs = interval.as_secs(),
            "Commit scheduler started"
        );
    }

    /// Stop the loop, run the final pass and wait for it.
    pub async fn stop(&self) {
        info!("Stopping commit scheduler");
        let _ = self.shutdown_tx.send(());

        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => {
                if tokio::time::timeout(self.retry.per_call_timeout, handle)
                    .await
                    .is_err()
                {
                    warn!("Commit scheduler did not stop in time");
                }
            }
            None => {
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Final commit pass failed");
                }
            }
        }

        info!("Commit scheduler stopped");
    }

    /// Run one aggregate/commit/clear pass.
    ///
    /// Fails only when the state store cannot be read; per-table failures are
    /// counted in the report and leave that table's state in place.
    pub async fn run_once(&self) -> Result<CommitReport> {
        let _pass = self.pass_lock.lock().await;
        let start = Instant::now();

        let Aggregate { pending, acked } = self.aggregate().await?;
        self.prune_committed(&pending, &acked);
        let mut report = CommitReport::default();

        for (table, pending) in pending {
            match self.commit_table(&table, pending).await {
                Ok(files) => {
                    if files > 0 {
                        report.tables_committed += 1;
                        report.files_committed += files;
                    }
                }
                Err(e) => {
                    error!(table = %table, error = %e, "Commit failed, state kept for next interval");
                    report.tables_failed += 1;
                }
            }
            self.set_table_state(&table, CommitState::Idle);
        }

        if report.tables_committed > 0 || report.tables_failed > 0 {
            info!(
                tables_committed = report.tables_committed,
                tables_failed = report.tables_failed,
                files_committed = report.files_committed,
                duration_ms = start.elapsed().as_millis() as u64,
                "Commit pass finished"
            );
        }

        Ok(report)
    }

    async fn aggregate(&self) -> Result<Aggregate> {
        let state = self
            .retry
            .bounded(
                &format!("get state {}", self.scope),
                self.state_store.get_state(&self.scope),
            )
            .await?;

        let mut pending: BTreeMap<TableIdent, PendingTable> = BTreeMap::new();
        let mut acked: HashMap<TableIdent, HashSet<String>> = HashMap::new();
        for (key, value) in &state {
            if key.starts_with(CONSUMED_KEY_PREFIX) {
                if let (Some((table, _)), Ok(paths)) =
                    (parse_consumed_key(key), paths_from_value(key, value))
                {
                    acked.entry(table).or_default().extend(paths);
                }
                continue;
            }
            if !key.starts_with(STREAMING_KEY_PREFIX) {
                continue;
            }
            let Some((table, _worker)) = parse_streaming_key(key) else {
                warn!(key = %key, "Ignoring state key without table identity");
                continue;
            };
            let paths = match paths_from_value(key, value) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring malformed state entry");
                    continue;
                }
            };

            let entry = pending.entry(table).or_default();
            entry.files.extend(paths);
            entry.keys.push(key.clone());
        }

        for table in pending.keys() {
            self.set_table_state(table, CommitState::Aggregating);
        }
        debug!(scope = %self.scope, tables = pending.len(), "Aggregated writer state");

        Ok(Aggregate { pending, acked })
    }

    /// Keep only committed paths some writer may still publish.
    fn prune_committed(
        &self,
        pending: &BTreeMap<TableIdent, PendingTable>,
        acked: &HashMap<TableIdent, HashSet<String>>,
    ) {
        let mut committed = self.committed.lock();
        committed.retain(|table, done| {
            let files = pending.get(table).map(|p| &p.files);
            let acked = acked.get(table);
            done.retain(|path| {
                files.is_some_and(|f| f.contains(path)) || acked.is_some_and(|a| a.contains(path))
            });
            !done.is_empty()
        });
    }

    /// Commit one table and clear its entries; returns the number of files added.
    async fn commit_table(&self, table: &TableIdent, pending: PendingTable) -> Result<usize> {
        let files: Vec<String> = {
            let committed = self.committed.lock();
            let done = committed.get(table);
            pending
                .files
                .into_iter()
                .filter(|path| done.map_or(true, |done| !done.contains(path)))
                .collect()
        };

        if !files.is_empty() {
            self.set_table_state(table, CommitState::Committing);

            let info = self
                .retry
                .bounded(&format!("load table {}", table), self.catalog.load_table(table))
                .await
                .inspect_err(|e| {
                    warn!(table = %table, error = %e, "Cannot load table, skipping this cycle");
                })?;

            let result =
                commit_with_retry(&self.catalog, &self.retry, info, &files, &self.snapshot_props)
                    .await?;
            self.committed
                .lock()
                .entry(table.clone())
                .or_default()
                .extend(files.iter().cloned());

            info!(
                table = %table,
                snapshot_id = result.snapshot_id,
                files = files.len(),
                "Committed data files"
            );
        } else {
            debug!(table = %table, "No new files, clearing entries");
        }

        self.set_table_state(table, CommitState::Clearing);
        self.clear_entries(table, &pending.keys).await?;

        Ok(files.len())
    }

    /// Acknowledge and remove the entries of `table` whose files are all committed.
    ///
    /// Each entry is read again first; one rewritten with new files since
    /// aggregation stays for the next interval.
    async fn clear_entries(&self, table: &TableIdent, keys: &[String]) -> Result<()> {
        let own_key = self
            .ledger
            .as_ref()
            .map(|_| streaming_key(table, self.worker));

        for key in keys {
            let Some(stored) = self
                .retry
                .bounded(
                    &format!("get state {}", key),
                    self.state_store.get_value(&self.scope, key),
                )
                .await?
            else {
                continue;
            };
            let Ok(paths) = paths_from_value(key, &stored) else {
                continue;
            };

            let covered = {
                let committed = self.committed.lock();
                let done = committed.get(table);
                paths
                    .iter()
                    .all(|path| done.is_some_and(|done| done.contains(path)))
            };
            if !covered {
                debug!(key = %key, "Entry has files newer than this pass, keeping it");
                continue;
            }
            let Some(ack_key) = consumed_key_of(key) else {
                continue;
            };

            let mut ack = HashMap::with_capacity(1);
            ack.insert(ack_key, stored);
            self.retry
                .bounded(
                    &format!("acknowledge {}", key),
                    self.state_store.set_state(&self.scope, ack),
                )
                .await?;
            self.retry
                .bounded(
                    &format!("remove state {}", key),
                    self.state_store
                        .remove_state(&self.scope, std::slice::from_ref(key)),
                )
                .await?;

            if own_key.as_deref() == Some(key.as_str()) {
                if let Some(ledger) = &self.ledger {
                    ledger.forget(table, &paths);
                }
            }
        }

        // files recorded locally while clearing go back to the store
        if let Some(ledger) = &self.ledger {
            if !ledger.paths(table).is_empty() {
                self.retry
                    .bounded(
                        &format!("persist files for {}", table),
                        ledger.persist_streaming(
                            self.state_store.as_ref(),
                            &self.scope,
                            table,
                            self.worker,
                        ),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    fn set_table_state(&self, table: &TableIdent, state: CommitState) {
        self.table_states.write().insert(table.clone(), state);
    }
}

/// Commit `files` to a loaded table, retrying with backoff.
///
/// The first attempt uses `table` as loaded; retries reload it so a snapshot
/// committed in between does not fail every attempt.
pub async fn commit_with_retry(
    catalog: &Arc<dyn CatalogOperations>,
    retry: &RetryPolicy,
    table: TableInfo,
    files: &[String],
    snapshot_props: &HashMap<String, String>,
) -> Result<CommitResult> {
    let ident = table.ident.clone();
    let mut preloaded = Some(table);

    retry
        .retry(&format!("commit {}", ident), || {
            let catalog = Arc::clone(catalog);
            let loaded = preloaded.take();
            let ident = &ident;
            async move {
                let table = match loaded {
                    Some(table) => table,
                    None => catalog.load_table(ident).await?,
                };
                let mut tx = Transaction::new(catalog, table);
                tx.add_files(files, snapshot_props, false)?;
                tx.commit().await
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnSpec, SourceType, TableSchema};
    use crate::iceberg::memory::MemoryCatalog;
    use crate::iceberg::type_mapper::map_schema;
    use crate::ledger::consumed_key;
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SCOPE: &str = "transfer-1";

    async fn setup(tables: &[&TableIdent]) -> (Arc<MemoryCatalog>, Arc<MemoryStateStore>) {
        let catalog = Arc::new(MemoryCatalog::new("/warehouse"));
        let schema = map_schema(
            Some(&TableSchema::new(vec![ColumnSpec::new("id", SourceType::Int64)])),
            "t",
        )
        .unwrap();
        for table in tables {
            catalog
                .create_table(table, &schema, &HashMap::new())
                .await
                .unwrap();
        }
        (catalog, Arc::new(MemoryStateStore::new()))
    }

    fn scheduler(
        catalog: Arc<MemoryCatalog>,
        store: Arc<MemoryStateStore>,
    ) -> Arc<CommitScheduler> {
        Arc::new(
            CommitScheduler::builder()
                .catalog(catalog)
                .state_store(store)
                .scope(SCOPE)
                .interval(Duration::from_secs(60))
                .retry(RetryPolicy::default().with_max_attempts(2))
                .build()
                .unwrap(),
        )
    }

    async fn publish(store: &MemoryStateStore, table: &TableIdent, worker: u32, files: &[&str]) {
        let mut state = HashMap::new();
        state.insert(streaming_key(table, worker), json!(files));
        store.set_state(SCOPE, state).await.unwrap();
    }

    async fn streaming_entries(store: &MemoryStateStore) -> Vec<String> {
        let mut keys: Vec<String> = store
            .get_state(SCOPE)
            .await
            .unwrap()
            .into_keys()
            .filter(|key| key.starts_with(STREAMING_KEY_PREFIX))
            .collect();
        keys.sort();
        keys
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Hook {
        GetState,
        RemoveState,
    }

    /// Has a writer record and publish `f2` in the middle of a leader pass.
    struct WriteDuringPass {
        inner: Arc<MemoryStateStore>,
        ledger: Arc<WriterFileLedger>,
        worker: u32,
        table: TableIdent,
        hook: Hook,
        fired: AtomicBool,
    }

    impl WriteDuringPass {
        fn new(
            inner: Arc<MemoryStateStore>,
            ledger: Arc<WriterFileLedger>,
            worker: u32,
            table: &TableIdent,
            hook: Hook,
        ) -> Arc<Self> {
            Arc::new(Self {
                inner,
                ledger,
                worker,
                table: table.clone(),
                hook,
                fired: AtomicBool::new(false),
            })
        }

        async fn fire(&self, hook: Hook, scope: &str) -> Result<()> {
            if hook == self.hook && !self.fired.swap(true, Ordering::SeqCst) {
                self.ledger.record(&self.table, "f2");
                self.ledger
                    .persist_streaming(self.inner.as_ref(), scope, &self.table, self.worker)
                    .await?;
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl StateStore for WriteDuringPass {
        async fn set_state(
            &self,
            scope: &str,
            state: HashMap<String, serde_json::Value>,
        ) -> Result<()> {
            self.inner.set_state(scope, state).await
        }

        async fn get_state(&self, scope: &str) -> Result<HashMap<String, serde_json::Value>> {
            let state = self.inner.get_state(scope).await?;
            self.fire(Hook::GetState, scope).await?;
            Ok(state)
        }

        async fn get_value(&self, scope: &str, key: &str) -> Result<Option<serde_json::Value>> {
            self.inner.get_value(scope, key).await
        }

        async fn remove_state(&self, scope: &str, keys: &[String]) -> Result<()> {
            self.fire(Hook::RemoveState, scope).await?;
            self.inner.remove_state(scope, keys).await
        }
    }

    fn leader(
        catalog: Arc<MemoryCatalog>,
        store: Arc<dyn StateStore>,
        ledger: Option<Arc<WriterFileLedger>>,
    ) -> CommitScheduler {
        let mut builder = CommitScheduler::builder()
            .catalog(catalog)
            .state_store(store)
            .worker(0)
            .scope(SCOPE);
        if let Some(ledger) = ledger {
            builder = builder.ledger(ledger);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_builder_requires_collaborators() {
        assert!(CommitScheduler::builder().build().is_err());
        let err = CommitScheduler::builder()
            .catalog(Arc::new(MemoryCatalog::new("/w")))
            .state_store(Arc::new(MemoryStateStore::new()))
            .interval(Duration::ZERO)
            .build();
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_run_once_commits_all_writers() {
        let table = TableIdent::new("db", "events");
        let (catalog, store) = setup(&[&table]).await;
        publish(&store, &table, 0, &["f0"]).await;
        publish(&store, &table, 1, &["f1", "f0"]).await;

        let scheduler = scheduler(catalog.clone(), store.clone());
        let report = scheduler.run_once().await.unwrap();

        assert_eq!(
            report,
            CommitReport {
                tables_committed: 1,
                tables_failed: 0,
                files_committed: 2
            }
        );
        assert_eq!(catalog.committed_files(&table), vec!["f0", "f1"]);
        assert_eq!(catalog.snapshot_count(&table), 1);
        assert!(streaming_entries(&store).await.is_empty());
        assert_eq!(
            store.get_value(SCOPE, &consumed_key(&table, 1)).await.unwrap(),
            Some(json!(["f1", "f0"]))
        );
        assert_eq!(scheduler.table_states()[&table], CommitState::Idle);
    }

    #[tokio::test]
    async fn test_missing_table_keeps_state() {
        let present = TableIdent::new("db", "present");
        let missing = TableIdent::new("db", "missing");
        let (catalog, store) = setup(&[&present]).await;
        publish(&store, &present, 0, &["a"]).await;
        publish(&store, &missing, 0, &["b"]).await;

        let report = scheduler(catalog.clone(), store.clone()).run_once().await.unwrap();

        assert_eq!(report.tables_committed, 1);
        assert_eq!(report.tables_failed, 1);
        assert_eq!(catalog.committed_files(&present), vec!["a"]);
        assert_eq!(streaming_entries(&store).await, vec![streaming_key(&missing, 0)]);
        assert!(store
            .get_value(SCOPE, &consumed_key(&missing, 0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_republished_files_not_committed_twice() {
        let table = TableIdent::new("db", "t");
        let (catalog, store) = setup(&[&table]).await;
        let scheduler = scheduler(catalog.clone(), store.clone());

        publish(&store, &table, 1, &["f1"]).await;
        scheduler.run_once().await.unwrap();

        // the writer keeps its full list and publishes it again
        publish(&store, &table, 1, &["f1", "f2"]).await;
        let report = scheduler.run_once().await.unwrap();

        assert_eq!(report.files_committed, 1);
        assert_eq!(catalog.committed_files(&table), vec!["f1", "f2"]);
        assert_eq!(catalog.snapshot_count(&table), 2);
    }

    #[tokio::test]
    async fn test_foreign_and_malformed_keys_ignored() {
        let table = TableIdent::new("db", "t");
        let (catalog, store) = setup(&[&table]).await;
        let mut state = HashMap::new();
        state.insert("files_for_0".to_string(), json!(["snap"]));
        state.insert(streaming_key(&table, 2), json!({"not": "a list"}));
        store.set_state(SCOPE, state).await.unwrap();

        let report = scheduler(catalog.clone(), store.clone()).run_once().await.unwrap();
        assert_eq!(report, CommitReport::default());
        assert_eq!(store.len(SCOPE), 2);
    }

    #[tokio::test]
    async fn test_ledger_pruned_after_commit() {
        let table = TableIdent::new("db", "t");
        let (catalog, store) = setup(&[&table]).await;
        let ledger = Arc::new(WriterFileLedger::new());
        ledger.record(&table, "f");
        ledger
            .persist_streaming(store.as_ref(), SCOPE, &table, 0)
            .await
            .unwrap();

        let scheduler = CommitScheduler::builder()
            .catalog(catalog.clone())
            .state_store(store.clone())
            .ledger(ledger.clone())
            .scope(SCOPE)
            .build()
            .unwrap();
        scheduler.run_once().await.unwrap();

        assert!(ledger.paths(&table).is_empty());
        assert_eq!(catalog.committed_files(&table), vec!["f"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_and_final_pass() {
        let table = TableIdent::new("db", "t");
        let (catalog, store) = setup(&[&table]).await;
        let scheduler = scheduler(catalog.clone(), store.clone());
        scheduler.start();
        assert!(scheduler.is_running());

        publish(&store, &table, 0, &["first"]).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(catalog.committed_files(&table), vec!["first"]);

        publish(&store, &table, 0, &["first", "last"]).await;
        scheduler.stop().await;

        assert_eq!(catalog.committed_files(&table), vec!["first", "last"]);
        assert!(!scheduler.is_running());
        assert!(streaming_entries(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_leader_file_written_while_clearing_is_committed() {
        let table = TableIdent::new("db", "t");
        let (catalog, inner) = setup(&[&table]).await;
        let ledger = Arc::new(WriterFileLedger::new());
        ledger.record(&table, "f1");
        ledger
            .persist_streaming(inner.as_ref(), SCOPE, &table, 0)
            .await
            .unwrap();

        let store = WriteDuringPass::new(inner.clone(), ledger.clone(), 0, &table, Hook::RemoveState);
        let scheduler = leader(catalog.clone(), store, Some(ledger.clone()));

        scheduler.run_once().await.unwrap();
        assert_eq!(catalog.committed_files(&table), vec!["f1"]);
        assert_eq!(ledger.paths(&table), vec!["f2"]);
        assert_eq!(streaming_entries(&inner).await, vec![streaming_key(&table, 0)]);

        scheduler.run_once().await.unwrap();
        assert_eq!(catalog.committed_files(&table), vec!["f1", "f2"]);
        assert!(ledger.paths(&table).is_empty());
        assert!(streaming_entries(&inner).await.is_empty());
    }

    #[tokio::test]
    async fn test_writer_file_published_while_clearing_is_committed() {
        let table = TableIdent::new("db", "t");
        let (catalog, inner) = setup(&[&table]).await;
        let writer = Arc::new(WriterFileLedger::new());
        writer.record(&table, "f1");
        writer
            .persist_streaming(inner.as_ref(), SCOPE, &table, 1)
            .await
            .unwrap();

        let store = WriteDuringPass::new(inner.clone(), writer.clone(), 1, &table, Hook::RemoveState);
        let scheduler = leader(catalog.clone(), store, None);
        scheduler.run_once().await.unwrap();

        // the removal took f2 with it, the writer still holds it
        assert!(streaming_entries(&inner).await.is_empty());
        writer
            .persist_streaming(inner.as_ref(), SCOPE, &table, 1)
            .await
            .unwrap();
        assert_eq!(writer.paths(&table), vec!["f2"]);

        scheduler.run_once().await.unwrap();
        assert_eq!(catalog.committed_files(&table), vec!["f1", "f2"]);
        assert_eq!(catalog.snapshot_count(&table), 2);
    }

    #[tokio::test]
    async fn test_entry_rewritten_since_aggregation_is_kept() {
        let table = TableIdent::new("db", "t");
        let (catalog, inner) = setup(&[&table]).await;
        let writer = Arc::new(WriterFileLedger::new());
        writer.record(&table, "f1");
        writer
            .persist_streaming(inner.as_ref(), SCOPE, &table, 1)
            .await
            .unwrap();

        let store = WriteDuringPass::new(inner.clone(), writer.clone(), 1, &table, Hook::GetState);
        let scheduler = leader(catalog.clone(), store, None);

        scheduler.run_once().await.unwrap();
        assert_eq!(catalog.committed_files(&table), vec!["f1"]);
        assert_eq!(
            inner.get_value(SCOPE, &streaming_key(&table, 1)).await.unwrap(),
            Some(json!(["f1", "f2"]))
        );
        assert!(inner
            .get_value(SCOPE, &consumed_key(&table, 1))
            .await
            .unwrap()
            .is_none());

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.files_committed, 1);
        assert_eq!(catalog.committed_files(&table), vec!["f1", "f2"]);
        assert!(streaming_entries(&inner).await.is_empty());

        writer
            .persist_streaming(inner.as_ref(), SCOPE, &table, 1)
            .await
            .unwrap();
        assert!(writer.paths(&table).is_empty());
    }

    #[tokio::test]
    async fn test_committed_paths_bounded_by_writer_lists() {
        let table = TableIdent::new("db", "t");
        let (catalog, store) = setup(&[&table]).await;
        let writer = WriterFileLedger::new();
        let scheduler = leader(catalog.clone(), store.clone(), None);

        writer.record(&table, "a");
        writer
            .persist_streaming(store.as_ref(), SCOPE, &table, 1)
            .await
            .unwrap();
        scheduler.run_once().await.unwrap();

        writer.record(&table, "b");
        writer
            .persist_streaming(store.as_ref(), SCOPE, &table, 1)
            .await
            .unwrap();
        // the writer's published list no longer carries the committed file
        assert_eq!(
            store.get_value(SCOPE, &streaming_key(&table, 1)).await.unwrap(),
            Some(json!(["b"]))
        );
        scheduler.run_once().await.unwrap();
        scheduler.run_once().await.unwrap();

        assert_eq!(catalog.committed_files(&table), vec!["a", "b"]);
        let committed = scheduler.committed.lock();
        assert_eq!(committed[&table], HashSet::from(["b".to_string()]));
    }

    #[tokio::test]
    async fn test_forget_table() {
        let table = TableIdent::new("db", "t");
        let (catalog, store) = setup(&[&table]).await;
        let scheduler = scheduler(catalog, store.clone());
        publish(&store, &table, 1, &["f"]).await;
        scheduler.run_once().await.unwrap();
        assert!(scheduler.committed.lock().contains_key(&table));

        scheduler.forget_table(&table).await;
        assert!(scheduler.committed.lock().is_empty());
        assert!(scheduler.table_states().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start_runs_final_pass() {
        let table = TableIdent::new("db", "t");
        let (catalog, store) = setup(&[&table]).await;
        publish(&store, &table, 0, &["f"]).await;

        scheduler(catalog.clone(), store).stop().await;
        assert_eq!(catalog.committed_files(&table), vec!["f"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_with_retry_reloads_stale_table() {
        let table = TableIdent::new("db", "t");
        let (catalog, _store) = setup(&[&table]).await;
        let stale = catalog.load_table(&table).await.unwrap();

        // another committer moves the table forward
        let fresh = catalog.load_table(&table).await.unwrap();
        let mut tx = Transaction::new(catalog.clone(), fresh);
        tx.add_files(&["other".to_string()], &HashMap::new(), false).unwrap();
        tx.commit().await.unwrap();

        let catalog: Arc<dyn CatalogOperations> = catalog.clone();
        let result = commit_with_retry(
            &catalog,
            &RetryPolicy::default().with_max_attempts(3),
            stale,
            &["mine".to_string()],
            &HashMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.files_added, 1);
    }
}
