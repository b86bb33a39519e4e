//! icesink core - streaming Iceberg table-commit pipeline
//!
//! This library turns a stream of typed row-change events into Apache Iceberg
//! tables written by any number of independent writer processes:
//!
//! - Row events encoded to Arrow and written as immutable Parquet data files
//! - Per-writer file ledgers published to a shared state store
//! - A leader-side scheduler committing every writer's files atomically per table
//! - Table creation on first use, drop and truncate
//! - Streaming and snapshot sink modes

pub mod commit_scheduler;
pub mod config;
pub mod error;
pub mod event;
pub mod iceberg;
pub mod ledger;
pub mod retry;
pub mod sink;
pub mod state;

// Re-export commonly used types
pub use commit_scheduler::{CommitReport, CommitScheduler, CommitSchedulerBuilder, CommitState};
pub use config::Config;
pub use error::{CatalogError, CommitError, DdlError, SchemaError, StateStoreError, WriteError};
pub use error::{Error, Result};
pub use event::{ColumnSpec, EventKind, RowEvent, SourceType, TableIdent, TableSchema, Value};
pub use ledger::WriterFileLedger;
pub use retry::RetryPolicy;
pub use sink::{open_sink, Sink, SnapshotSink, StreamingSink};
pub use state::{open_state_store, MemoryStateStore, ObjectStoreStateStore, StateStore};
