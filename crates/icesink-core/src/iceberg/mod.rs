//! Iceberg table output.
//!
//! This module provides the destination side of the pipeline:
//!
//! - Source schema → Iceberg schema mapping with stable field IDs
//! - Row events → Arrow RecordBatch encoding with per-field coercion
//! - Arrow → Parquet data files on object storage (S3, local filesystem)
//! - Catalog integration (REST, Glue, in-memory) behind one trait
//! - Avro manifests and manifest lists for every committed snapshot
//! - Table lifecycle: create on first use, drop, truncate

pub mod catalog;
pub mod encoder;
pub mod glue;
pub mod manifest;
pub mod memory;
pub mod metadata;
pub mod rest;
pub mod rest_api;
pub mod storage;
pub mod table_manager;
pub mod type_mapper;
pub mod writer;

pub use catalog::{
    CatalogFactory, CatalogFactoryRegistry, CatalogOperations, CommitResult, FileCommit,
    TableInfo, Transaction,
};
pub use encoder::encode_rows;
pub use glue::{GlueCatalogClient, GlueCatalogFactory, GlueClientConfig};
pub use manifest::{new_snapshot_id, DataFileEntry, ManifestFile, SnapshotProducer};
pub use memory::{MemoryCatalog, MemoryCatalogFactory};
pub use metadata::TableMetadata;
pub use rest::{RestCatalogClient, RestCatalogFactory, RestClientConfig};
pub use storage::Storage;
pub use table_manager::{DdlKind, TableLifecycleManager, TableLifecycleManagerBuilder};
pub use type_mapper::{
    map_schema, to_arrow_schema, DestinationField, DestinationSchema, IcebergType,
};
pub use writer::DataFileWriter;
