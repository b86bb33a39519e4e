//! Integration tests for icesink-core.
//!
//! These tests run whole writer/leader scenarios against the in-memory catalog,
//! the in-memory or object-store state store, and a local warehouse directory.
//!
//! Run with: cargo test --test integration_tests

use icesink_core::config::{Config, SinkMode, StateStoreKind};
use icesink_core::event::{ColumnSpec, EventKind, RowEvent, SourceType, TableIdent, TableSchema, Value};
use icesink_core::iceberg::{CatalogOperations, MemoryCatalog};
use icesink_core::ledger::{consumed_key, STREAMING_KEY_PREFIX};
use icesink_core::state::{MemoryStateStore, StateStore};
use icesink_core::{Sink, SnapshotSink, StreamingSink};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn orders_schema() -> Arc<TableSchema> {
    Arc::new(TableSchema::new(vec![
        ColumnSpec::new("id", SourceType::Int64).required().primary_key(),
        ColumnSpec::new("name", SourceType::String).required(),
        ColumnSpec::new("tag", SourceType::Any),
    ]))
}

fn order(namespace: &str, table: &str, id: i64) -> RowEvent {
    RowEvent::insert(
        namespace,
        table,
        orders_schema(),
        vec![
            ("id", Value::Int(id)),
            ("name", Value::from(format!("order-{}", id))),
            ("tag", Value::Json(serde_json::json!({"n": id}))),
        ],
    )
}

/// Streaming entries still waiting for the leader.
async fn pending_entries(store: &dyn StateStore, scope: &str) -> Vec<String> {
    store
        .get_state(scope)
        .await
        .expect("state")
        .into_keys()
        .filter(|key| key.starts_with(STREAMING_KEY_PREFIX))
        .collect()
}

fn writer_config(warehouse: &TempDir, index: u32, count: u32) -> Config {
    let mut config = Config::local(warehouse.path().to_str().expect("utf-8 temp path"));
    config.worker.index = index;
    config.worker.count = count;
    config.worker.transfer_id = "orders-transfer".to_string();
    config
}

mod streaming_integration {
    use super::*;
    use icesink_core::iceberg::{CommitResult, DestinationSchema, FileCommit, TableInfo};
    use icesink_core::{CommitError, CommitScheduler, RetryPolicy, Result};
    use async_trait::async_trait;

    /// Two writers each produce a file; one leader cycle commits both and
    /// leaves no state behind.
    #[tokio::test]
    async fn test_two_writers_one_cycle() {
        let warehouse = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(MemoryCatalog::new("/warehouse"));
        let store = Arc::new(MemoryStateStore::new());

        let leader = StreamingSink::new(&writer_config(&warehouse, 0, 2), catalog.clone(), store.clone())
            .expect("Failed to open leader");
        let follower = StreamingSink::new(&writer_config(&warehouse, 1, 2), catalog.clone(), store.clone())
            .expect("Failed to open follower");
        assert!(leader.scheduler().is_some());
        assert!(follower.scheduler().is_none());

        leader
            .push(vec![order("sales", "orders", 1), order("sales", "orders", 2)])
            .await
            .expect("leader push");
        follower
            .push(vec![order("sales", "orders", 3)])
            .await
            .expect("follower push");
        assert_eq!(store.len("orders-transfer"), 2);

        let scheduler = leader.scheduler().expect("leader has scheduler");
        let report = scheduler.run_once().await.expect("commit pass");
        assert_eq!(report.tables_committed, 1);
        assert_eq!(report.files_committed, 2);

        let table = TableIdent::new("sales", "orders");
        let files = catalog.committed_files(&table);
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.ends_with("-0-00000.parquet")));
        assert!(files.iter().any(|f| f.ends_with("-0-00001.parquet")));
        assert!(pending_entries(store.as_ref(), "orders-transfer").await.is_empty());
        assert!(leader.ledger().paths(&table).is_empty());
        let acked = store
            .get_value("orders-transfer", &consumed_key(&table, 1))
            .await
            .expect("state");
        assert!(acked.is_some());

        // committed files hold every row
        let total_rows: usize = files.iter().map(|f| parquet_row_count(f)).sum();
        assert_eq!(total_rows, 3);

        follower.close().await.expect("close follower");
        leader.close().await.expect("close leader");
    }

    /// Closing the leader runs a final commit pass.
    #[tokio::test]
    async fn test_close_runs_final_pass() {
        let warehouse = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(MemoryCatalog::new("/warehouse"));
        let store = Arc::new(MemoryStateStore::new());

        let leader = StreamingSink::new(&writer_config(&warehouse, 0, 1), catalog.clone(), store.clone())
            .expect("Failed to open leader");
        leader
            .push(vec![order("", "orders", 1)])
            .await
            .expect("push");

        leader.close().await.expect("close");

        let table = TableIdent::new("default", "orders");
        assert_eq!(catalog.committed_files(&table).len(), 1);
        assert!(pending_entries(store.as_ref(), "orders-transfer").await.is_empty());
    }

    /// Identities containing underscores survive the state key round trip.
    #[tokio::test]
    async fn test_underscore_table_names() {
        let warehouse = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(MemoryCatalog::new("/warehouse"));
        let store = Arc::new(MemoryStateStore::new());

        let writer = StreamingSink::new(&writer_config(&warehouse, 1, 2), catalog.clone(), store.clone())
            .expect("Failed to open writer");
        writer
            .push(vec![order("sales_eu", "order_items_v2", 1)])
            .await
            .expect("push");

        let state = store.get_state("orders-transfer").await.expect("state");
        assert!(state.contains_key("streaming_files_sales_eu.order_items_v2_1"));

        let scheduler = CommitScheduler::builder()
            .catalog(catalog.clone())
            .state_store(store.clone())
            .scope("orders-transfer")
            .build()
            .expect("scheduler");
        scheduler.run_once().await.expect("commit pass");

        let table = TableIdent::new("sales_eu", "order_items_v2");
        assert_eq!(catalog.committed_files(&table).len(), 1);
    }

    /// Catalog that rejects every commit to one table.
    struct RejectingCatalog {
        inner: Arc<MemoryCatalog>,
        reject: TableIdent,
    }

    #[async_trait]
    impl CatalogOperations for RejectingCatalog {
        async fn load_table(&self, ident: &TableIdent) -> Result<TableInfo> {
            self.inner.load_table(ident).await
        }

        async fn create_table(
            &self,
            ident: &TableIdent,
            schema: &DestinationSchema,
            properties: &HashMap<String, String>,
        ) -> Result<TableInfo> {
            self.inner.create_table(ident, schema, properties).await
        }

        async fn drop_table(&self, ident: &TableIdent) -> Result<()> {
            self.inner.drop_table(ident).await
        }

        async fn commit_files(&self, ident: &TableIdent, commit: FileCommit) -> Result<CommitResult> {
            if *ident == self.reject {
                return Err(CommitError::Rejected {
                    table: ident.to_string(),
                    message: "service unavailable".into(),
                }
                .into());
            }
            self.inner.commit_files(ident, commit).await
        }

        fn catalog_type(&self) -> icesink_core::config::CatalogType {
            self.inner.catalog_type()
        }
    }

    /// A failing table keeps its state and does not block other tables.
    #[tokio::test]
    async fn test_failing_commit_isolated() {
        let warehouse = TempDir::new().expect("Failed to create temp dir");
        let memory = Arc::new(MemoryCatalog::new("/warehouse"));
        let bad = TableIdent::new("sales", "bad");
        let good = TableIdent::new("sales", "good");
        let catalog = Arc::new(RejectingCatalog {
            inner: memory.clone(),
            reject: bad.clone(),
        });
        let store = Arc::new(MemoryStateStore::new());

        let writer = StreamingSink::new(&writer_config(&warehouse, 1, 2), catalog.clone(), store.clone())
            .expect("Failed to open writer");
        writer
            .push(vec![order("sales", "bad", 1), order("sales", "good", 2)])
            .await
            .expect("push");

        let scheduler = CommitScheduler::builder()
            .catalog(catalog)
            .state_store(store.clone())
            .scope("orders-transfer")
            .retry(RetryPolicy::default().with_max_attempts(1))
            .build()
            .expect("scheduler");
        let report = scheduler.run_once().await.expect("commit pass");

        assert_eq!(report.tables_committed, 1);
        assert_eq!(report.tables_failed, 1);
        assert_eq!(memory.committed_files(&good).len(), 1);
        assert!(memory.committed_files(&bad).is_empty());

        let state = store.get_state("orders-transfer").await.expect("state");
        assert_eq!(state.len(), 1);
        assert!(state.contains_key("streaming_files_sales.bad_1"));
    }

    /// Drop and truncate go through the lifecycle manager.
    #[tokio::test]
    async fn test_drop_and_truncate() {
        let warehouse = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(MemoryCatalog::new("/warehouse"));
        let store = Arc::new(MemoryStateStore::new());
        let leader = StreamingSink::new(&writer_config(&warehouse, 0, 1), catalog.clone(), store.clone())
            .expect("Failed to open leader");
        let table = TableIdent::new("sales", "orders");

        leader.push(vec![order("sales", "orders", 1)]).await.expect("push");
        leader
            .scheduler()
            .expect("leader")
            .run_once()
            .await
            .expect("commit pass");
        let schema_before = catalog.load_table(&table).await.expect("load").schema;
        assert_eq!(catalog.committed_files(&table).len(), 1);

        leader
            .push(vec![RowEvent::control(EventKind::TruncateTable, "sales", "orders", None)])
            .await
            .expect("truncate");
        let after = catalog.load_table(&table).await.expect("load");
        assert_eq!(after.schema, schema_before);
        assert!(catalog.committed_files(&table).is_empty());

        leader
            .push(vec![RowEvent::control(EventKind::DropTable, "sales", "orders", None)])
            .await
            .expect("drop");
        assert!(!catalog.contains(&table));

        // dropping a missing table is a no-op
        leader
            .push(vec![RowEvent::control(EventKind::DropTable, "sales", "orders", None)])
            .await
            .expect("drop missing");

        leader.close().await.expect("close");
    }

    fn parquet_row_count(path: &str) -> usize {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let file = std::fs::File::open(path).expect("open data file");
        let reader = SerializedFileReader::new(file).expect("read parquet footer");
        reader.metadata().file_metadata().num_rows() as usize
    }
}

mod snapshot_integration {
    use super::*;

    /// `DoneShardedTableLoad` commits every writer's `files_for_*` list.
    #[tokio::test]
    async fn test_sharded_load_commit() {
        let warehouse = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(MemoryCatalog::new("/warehouse"));
        let store = Arc::new(MemoryStateStore::new());

        let mut configs = Vec::new();
        for index in 0..2 {
            let mut config = writer_config(&warehouse, index, 2);
            config.destination.mode = SinkMode::Snapshot;
            config
                .destination
                .snapshot_props
                .insert("load-id".to_string(), "initial".to_string());
            configs.push(config);
        }

        let main = SnapshotSink::new(&configs[0], catalog.clone(), store.clone()).expect("main sink");
        let shard = SnapshotSink::new(&configs[1], catalog.clone(), store.clone()).expect("shard sink");

        shard
            .push(vec![
                RowEvent::control(EventKind::InitTableLoad, "sales", "orders", Some(orders_schema())),
                order("sales", "orders", 1),
                order("sales", "orders", 2),
                RowEvent::control(EventKind::DoneTableLoad, "sales", "orders", Some(orders_schema())),
            ])
            .await
            .expect("shard push");
        main.push(vec![
            order("sales", "orders", 3),
            RowEvent::control(EventKind::DoneTableLoad, "sales", "orders", Some(orders_schema())),
        ])
        .await
        .expect("main push");

        let table = TableIdent::new("sales", "orders");
        assert!(catalog.committed_files(&table).is_empty());

        main.push(vec![RowEvent::control(
            EventKind::DoneShardedTableLoad,
            "sales",
            "orders",
            Some(orders_schema()),
        )])
        .await
        .expect("finish load");

        assert_eq!(catalog.committed_files(&table).len(), 2);
        assert_eq!(catalog.snapshot_count(&table), 1);
        let summary = catalog.last_summary(&table).expect("snapshot summary");
        assert_eq!(summary.get("load-id").map(String::as_str), Some("initial"));
        assert!(store.get_state("orders-transfer").await.expect("state").is_empty());

        main.close().await.expect("close");
        shard.close().await.expect("close");
    }
}

mod state_integration {
    use super::*;
    use icesink_core::state::open_state_store;
    use icesink_core::CommitScheduler;

    /// Writers and leader in separate "processes" share state through object storage.
    #[tokio::test]
    async fn test_object_store_state_across_processes() {
        let warehouse = TempDir::new().expect("Failed to create temp dir");
        let catalog = Arc::new(MemoryCatalog::new("/warehouse"));

        let mut follower_config = writer_config(&warehouse, 1, 2);
        follower_config.state.kind = StateStoreKind::ObjectStore;
        let follower_store = open_state_store(&follower_config).expect("follower state");
        let follower = StreamingSink::new(&follower_config, catalog.clone(), follower_store)
            .expect("Failed to open follower");
        follower
            .push(vec![order("sales", "orders", 1)])
            .await
            .expect("push");

        let leader_store = open_state_store(&follower_config).expect("leader state");
        assert_eq!(
            leader_store
                .get_state("orders-transfer")
                .await
                .expect("state")
                .len(),
            1
        );

        let scheduler = CommitScheduler::builder()
            .catalog(catalog.clone())
            .state_store(leader_store.clone())
            .scope("orders-transfer")
            .build()
            .expect("scheduler");
        let report = scheduler.run_once().await.expect("commit pass");
        assert_eq!(report.files_committed, 1);
        assert!(pending_entries(leader_store.as_ref(), "orders-transfer").await.is_empty());

        // the follower sees the acknowledgement and stops publishing the file
        follower
            .push(vec![order("sales", "orders", 2)])
            .await
            .expect("push");
        let pending = leader_store
            .get_state("orders-transfer")
            .await
            .expect("state");
        let listed: Vec<String> =
            serde_json::from_value(pending["streaming_files_sales.orders_1"].clone()).expect("paths");
        assert_eq!(listed.len(), 1);
        assert_eq!(follower.ledger().paths(&TableIdent::new("sales", "orders")), listed);
    }
}

mod schema_integration {
    use super::*;
    use icesink_core::iceberg::{map_schema, IcebergType};

    #[test]
    fn test_mapping_scenario() {
        let schema = map_schema(Some(orders_schema().as_ref()), "sales.orders").expect("map schema");
        let fields: Vec<(i32, IcebergType)> = schema
            .fields
            .iter()
            .map(|f| (f.id, f.field_type))
            .collect();
        assert_eq!(
            fields,
            vec![
                (1, IcebergType::Long),
                (2, IcebergType::String),
                (3, IcebergType::String)
            ]
        );
        assert_eq!(schema.identifier_field_ids, vec![1]);

        // mapping is deterministic
        let again = map_schema(Some(orders_schema().as_ref()), "sales.orders").expect("map schema");
        assert_eq!(schema, again);
    }
}
