//! Host-facing sinks.
//!
//! The host pushes batches of [`RowEvent`]s. Row events are grouped by table in
//! order of first appearance, each group becomes one data file, and control
//! events are applied in stream order between groups.
//!
//! - [`StreamingSink`]: publishes its file list after every write; the leader
//!   writer also runs the [`CommitScheduler`]
//! - [`SnapshotSink`]: publishes on `DoneTableLoad` and commits every writer's
//!   files on `DoneShardedTableLoad`

use crate::commit_scheduler::{commit_with_retry, CommitScheduler};
use crate::config::{Config, SinkMode};
use crate::event::{EventKind, RowEvent, TableIdent, TableSchema};
use crate::iceberg::catalog::{CatalogFactoryRegistry, CatalogOperations};
use crate::iceberg::table_manager::{DdlKind, TableLifecycleManager};
use crate::iceberg::writer::DataFileWriter;
use crate::ledger::{
    consumed_key_of, paths_from_value, parse_streaming_key, snapshot_key, WriterFileLedger,
    SNAPSHOT_KEY_PREFIX,
};
use crate::retry::RetryPolicy;
use crate::state::{open_state_store, StateStore};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Destination for batches of row events.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Write a batch of events.
    async fn push(&self, events: Vec<RowEvent>) -> Result<()>;

    /// Cancel outstanding work and release background tasks.
    async fn close(&self) -> Result<()>;
}

/// Open the sink selected by `config.destination.mode`.
pub async fn open_sink(config: &Config) -> Result<Arc<dyn Sink>> {
    let registry = CatalogFactoryRegistry::with_defaults();
    let catalog = registry.create(&config.destination).await?;
    let state_store = open_state_store(config)?;

    let sink: Arc<dyn Sink> = match config.destination.mode {
        SinkMode::Streaming => Arc::new(StreamingSink::new(config, catalog, state_store)?),
        SinkMode::Snapshot => Arc::new(SnapshotSink::new(config, catalog, state_store)?),
    };
    Ok(sink)
}

/// Rows of one table within a batch.
struct TableGroup {
    ident: TableIdent,
    rows: Vec<RowEvent>,
}

/// Group row events by table, keeping first-appearance and row order.
fn group_rows(rows: Vec<RowEvent>, default_namespace: &str) -> Vec<TableGroup> {
    let mut groups: Vec<TableGroup> = Vec::new();
    let mut index: HashMap<TableIdent, usize> = HashMap::new();

    for row in rows {
        let ident = row.table_ident().with_default_namespace(default_namespace);
        match index.get(&ident) {
            Some(&i) => groups[i].rows.push(row),
            None => {
                index.insert(ident.clone(), groups.len());
                groups.push(TableGroup {
                    ident,
                    rows: vec![row],
                });
            }
        }
    }

    groups
}

/// Split a batch into row runs and the control event that ends each run.
fn segments(events: Vec<RowEvent>) -> Vec<(Vec<RowEvent>, Option<RowEvent>)> {
    let mut segments = Vec::new();
    let mut rows = Vec::new();

    for event in events {
        if event.is_row_event() {
            rows.push(event);
        } else {
            segments.push((std::mem::take(&mut rows), Some(event)));
        }
    }
    if !rows.is_empty() {
        segments.push((rows, None));
    }

    segments
}

/// State and collaborators shared by both sinks.
struct SinkCore {
    worker: u32,
    scope: String,
    default_namespace: String,
    snapshot_props: HashMap<String, String>,
    catalog: Arc<dyn CatalogOperations>,
    state_store: Arc<dyn StateStore>,
    tables: TableLifecycleManager,
    writer: DataFileWriter,
    ledger: Arc<WriterFileLedger>,
    retry: RetryPolicy,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl SinkCore {
    fn new(
        config: &Config,
        catalog: Arc<dyn CatalogOperations>,
        state_store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from(&config.retry);
        let writer = DataFileWriter::from_config(&config.destination)?.with_retry(retry.clone());
        let tables = TableLifecycleManager::builder()
            .catalog(Arc::clone(&catalog))
            .properties(config.destination.properties.clone())
            .build()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            worker: config.worker.index,
            scope: config.worker.transfer_id.clone(),
            default_namespace: config.destination.default_namespace.clone(),
            snapshot_props: config.destination.snapshot_props.clone(),
            catalog,
            state_store,
            tables,
            writer,
            ledger: Arc::new(WriterFileLedger::new()),
            retry,
            closed: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Run `fut` bounded by the per-call timeout and cancelled by close.
    async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        tokio::select! {
            result = self.retry.bounded(operation, fut) => result,
            _ = shutdown_rx.recv() => Err(Error::Shutdown),
        }
    }

    fn cancel(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    fn ident(&self, event: &RowEvent) -> TableIdent {
        event
            .table_ident()
            .with_default_namespace(&self.default_namespace)
    }

    /// Ensure the table and write one group as a data file.
    async fn write_group(&self, group: &TableGroup) -> Result<Option<String>> {
        let ident = &group.ident;
        let schema: Option<&TableSchema> = group.rows.iter().find_map(|r| r.table_schema.as_deref());

        let table = self
            .call(
                &format!("ensure table {}", ident),
                self.tables.ensure_table(ident, schema),
            )
            .await?;

        let seq = self.ledger.next_seq();
        let path = self
            .call(
                &format!("write data file for {}", ident),
                self.writer.write(&table, self.worker, seq, &group.rows),
            )
            .await?;

        if let Some(path) = &path {
            self.ledger.record(ident, path.clone());
        }
        Ok(path)
    }

    /// Apply a drop or truncate event.
    async fn apply_ddl(&self, event: &RowEvent, kind: DdlKind) -> Result<()> {
        let ident = self.ident(event);
        info!(table = %ident, ?kind, "Applying DDL event");

        self.call(
            &format!("{:?} table {}", kind, ident),
            self.tables
                .drop_or_truncate(&ident, kind, event.table_schema.as_deref()),
        )
        .await
    }
}

/// Sink for continuous replication.
pub struct StreamingSink {
    core: SinkCore,
    scheduler: Option<Arc<CommitScheduler>>,
}

impl StreamingSink {
    /// Create the sink; the leader writer starts its commit scheduler.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: &Config,
        catalog: Arc<dyn CatalogOperations>,
        state_store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let core = SinkCore::new(config, catalog, state_store)?;

        let scheduler = if config.worker.is_leader() {
            let scheduler = Arc::new(
                CommitScheduler::builder()
                    .config(config)
                    .catalog(Arc::clone(&core.catalog))
                    .state_store(Arc::clone(&core.state_store))
                    .ledger(Arc::clone(&core.ledger))
                    .build()?,
            );
            scheduler.start();
            Some(scheduler)
        } else {
            None
        };

        info!(
            worker = core.worker,
            scope = %core.scope,
            leader = scheduler.is_some(),
            "Streaming sink opened"
        );

        Ok(Self { core, scheduler })
    }

    /// Commit scheduler of the leader writer.
    pub fn scheduler(&self) -> Option<&Arc<CommitScheduler>> {
        self.scheduler.as_ref()
    }

    /// This writer's file ledger.
    pub fn ledger(&self) -> &Arc<WriterFileLedger> {
        &self.core.ledger
    }

    async fn write_rows(&self, rows: Vec<RowEvent>) -> Result<()> {
        for group in group_rows(rows, &self.core.default_namespace) {
            if self.core.write_group(&group).await?.is_none() {
                continue;
            }
            self.core
                .call(
                    &format!("persist files for {}", group.ident),
                    self.core.ledger.persist_streaming(
                        self.core.state_store.as_ref(),
                        &self.core.scope,
                        &group.ident,
                        self.core.worker,
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_control(&self, event: RowEvent) -> Result<()> {
        let kind = match event.kind {
            EventKind::DropTable => DdlKind::Drop,
            EventKind::TruncateTable => DdlKind::Truncate,
            other => {
                debug!(kind = ?other, table = %event.table, "Ignoring control event");
                return Ok(());
            }
        };

        self.core.apply_ddl(&event, kind).await?;

        // files written before the drop must not land in the new table
        let ident = self.core.ident(&event);
        self.core.ledger.reset(&ident);
        self.discard_entries(&ident).await?;
        if let Some(scheduler) = &self.scheduler {
            scheduler.forget_table(&ident).await;
        }
        Ok(())
    }

    /// Acknowledge and remove every writer's pending entry for `table`.
    ///
    /// Writers drop acknowledged files on their next publish.
    async fn discard_entries(&self, table: &TableIdent) -> Result<()> {
        let core = &self.core;
        let state = core
            .call(
                &format!("get state {}", core.scope),
                core.state_store.get_state(&core.scope),
            )
            .await?;

        let mut acks = HashMap::new();
        let mut keys = Vec::new();
        for (key, value) in state {
            if !parse_streaming_key(&key).is_some_and(|(t, _)| &t == table) {
                continue;
            }
            if let Some(ack) = consumed_key_of(&key) {
                acks.insert(ack, value);
            }
            keys.push(key);
        }
        if keys.is_empty() {
            return Ok(());
        }

        debug!(table = %table, entries = keys.len(), "Discarding pending files");
        core.call(
            &format!("acknowledge files for {}", table),
            core.state_store.set_state(&core.scope, acks),
        )
        .await?;
        core.call(
            &format!("remove files for {}", table),
            core.state_store.remove_state(&core.scope, &keys),
        )
        .await
    }

    /// Publish every table this writer still holds files for.
    async fn republish(&self) {
        let core = &self.core;
        for table in core.ledger.tables() {
            let result = core
                .call(
                    &format!("persist files for {}", table),
                    core.ledger.persist_streaming(
                        core.state_store.as_ref(),
                        &core.scope,
                        &table,
                        core.worker,
                    ),
                )
                .await;
            if let Err(e) = result {
                warn!(table = %table, error = %e, "Cannot publish pending files on close");
            }
        }
    }
}

#[async_trait]
impl Sink for StreamingSink {
    async fn push(&self, events: Vec<RowEvent>) -> Result<()> {
        for (rows, control) in segments(events) {
            self.write_rows(rows).await?;
            if let Some(event) = control {
                self.handle_control(event).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // entries removed while this writer was publishing are restored
        self.republish().await;
        self.core.cancel();
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }
        info!(worker = self.core.worker, "Streaming sink closed");
        Ok(())
    }
}

/// Sink for one-off table loads.
pub struct SnapshotSink {
    core: SinkCore,
}

impl SnapshotSink {
    pub fn new(
        config: &Config,
        catalog: Arc<dyn CatalogOperations>,
        state_store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let core = SinkCore::new(config, catalog, state_store)?;
        info!(worker = core.worker, scope = %core.scope, "Snapshot sink opened");
        Ok(Self { core })
    }

    /// This writer's file ledger.
    pub fn ledger(&self) -> &Arc<WriterFileLedger> {
        &self.core.ledger
    }

    async fn handle_control(&self, event: RowEvent) -> Result<()> {
        match event.kind {
            EventKind::DoneTableLoad => {
                self.core
                    .call(
                        &format!("persist {}", snapshot_key(self.core.worker)),
                        self.core.ledger.persist_snapshot(
                            self.core.state_store.as_ref(),
                            &self.core.scope,
                            self.core.worker,
                        ),
                    )
                    .await
            }
            EventKind::DoneShardedTableLoad => self.finish_sharded_load(&event).await,
            EventKind::DropTable => self.core.apply_ddl(&event, DdlKind::Drop).await,
            EventKind::TruncateTable => self.core.apply_ddl(&event, DdlKind::Truncate).await,
            other => {
                debug!(kind = ?other, table = %event.table, "Ignoring control event");
                Ok(())
            }
        }
    }

    /// Commit the files of every writer in one transaction.
    async fn finish_sharded_load(&self, event: &RowEvent) -> Result<()> {
        let core = &self.core;
        let ident = core.ident(event);

        let state = core
            .call(
                &format!("get state {}", core.scope),
                core.state_store.get_state(&core.scope),
            )
            .await?;

        let mut keys = Vec::new();
        let mut files: BTreeSet<String> = core.ledger.all_paths().into_iter().collect();
        for (key, value) in &state {
            if key.starts_with(SNAPSHOT_KEY_PREFIX) {
                files.extend(paths_from_value(key, value)?);
                keys.push(key.clone());
            }
        }

        if files.is_empty() {
            info!(table = %ident, "Sharded load finished without data files");
        } else {
            let table = core
                .call(
                    &format!("ensure table {}", ident),
                    core.tables.ensure_table(&ident, event.table_schema.as_deref()),
                )
                .await?;
            let files: Vec<String> = files.into_iter().collect();

            let result = commit_with_retry(
                &core.catalog,
                &core.retry,
                table,
                &files,
                &core.snapshot_props,
            )
            .await?;
            info!(
                table = %ident,
                snapshot_id = result.snapshot_id,
                files = files.len(),
                writers = keys.len(),
                "Committed sharded load"
            );
        }

        if !keys.is_empty() {
            core.call(
                &format!("remove state {}", core.scope),
                core.state_store.remove_state(&core.scope, &keys),
            )
            .await?;
        }
        core.ledger.clear();
        Ok(())
    }
}

#[async_trait]
impl Sink for SnapshotSink {
    async fn push(&self, events: Vec<RowEvent>) -> Result<()> {
        for (rows, control) in segments(events) {
            for group in group_rows(rows, &self.core.default_namespace) {
                self.core.write_group(&group).await?;
            }
            if let Some(event) = control {
                self.handle_control(event).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.core.cancel();
        let pending = self.core.ledger.all_paths().len();
        if pending > 0 {
            warn!(files = pending, "Snapshot sink closed with unpublished files");
        }
        Ok(())
    }
}
