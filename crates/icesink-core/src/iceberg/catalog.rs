//! Catalog seam and table transactions.
//!
//! [`CatalogOperations`] abstracts the operations the pipeline needs from an
//! Iceberg catalog, regardless of the underlying implementation (REST, Glue,
//! in-memory). Catalog clients are built from configuration through a
//! [`CatalogFactoryRegistry`].

use crate::config::{CatalogType, DestinationConfig};
use crate::error::CommitError;
use crate::event::TableIdent;
use crate::iceberg::type_mapper::DestinationSchema;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Snapshot summary key recording how many data files a commit added.
pub const SUMMARY_ADDED_DATA_FILES: &str = "added-data-files";
/// Snapshot summary key recording the operation.
pub const SUMMARY_OPERATION: &str = "operation";

/// Trait defining catalog operations.
#[async_trait]
pub trait CatalogOperations: Send + Sync {
    /// Load table metadata; fails with `CatalogError::TableNotFound` when absent.
    async fn load_table(&self, ident: &TableIdent) -> Result<TableInfo>;

    /// Create a new table; fails with `CatalogError::TableAlreadyExists` when present.
    async fn create_table(
        &self,
        ident: &TableIdent,
        schema: &DestinationSchema,
        properties: &HashMap<String, String>,
    ) -> Result<TableInfo>;

    /// Drop a table.
    async fn drop_table(&self, ident: &TableIdent) -> Result<()>;

    /// Atomically publish data files as a new snapshot.
    async fn commit_files(&self, ident: &TableIdent, commit: FileCommit) -> Result<CommitResult>;

    /// Get the catalog type.
    fn catalog_type(&self) -> CatalogType;
}

/// Live binding between a table identity and a committed table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Table identity
    pub ident: TableIdent,
    /// Table location in storage
    pub location: String,
    /// Current snapshot ID (if any)
    pub current_snapshot_id: Option<i64>,
    /// Column layout of the table
    pub schema: DestinationSchema,
    /// Table properties
    pub properties: HashMap<String, String>,
}

/// A request to publish data files.
#[derive(Debug, Clone, Default)]
pub struct FileCommit {
    /// Expected current snapshot ID (for CAS)
    pub expected_snapshot_id: Option<i64>,
    /// Data file paths to add
    pub files: Vec<String>,
    /// Snapshot summary properties
    pub summary: HashMap<String, String>,
    /// Replace the table contents instead of appending
    pub overwrite: bool,
}

/// Result of a commit.
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// The new snapshot ID
    pub snapshot_id: i64,
    /// Timestamp when the snapshot was created
    pub committed_at: DateTime<Utc>,
    /// Number of files added
    pub files_added: usize,
}

/// A pending change to one table.
///
/// Files are collected with [`Transaction::add_files`] and published together
/// by [`Transaction::commit`], guarded by the snapshot the table had when the
/// transaction was opened.
pub struct Transaction {
    catalog: Arc<dyn CatalogOperations>,
    table: TableInfo,
    files: Vec<String>,
    summary: HashMap<String, String>,
    overwrite: bool,
}

impl Transaction {
    /// Open a transaction on a loaded table.
    pub fn new(catalog: Arc<dyn CatalogOperations>, table: TableInfo) -> Self {
        Self {
            catalog,
            table,
            files: Vec::new(),
            summary: HashMap::new(),
            overwrite: false,
        }
    }

    /// Add data files with snapshot properties.
    pub fn add_files(
        &mut self,
        paths: &[String],
        snapshot_props: &HashMap<String, String>,
        overwrite: bool,
    ) -> Result<()> {
        if let Some(bad) = paths.iter().find(|p| p.is_empty()) {
            return Err(CommitError::AddFiles {
                table: self.table.ident.to_string(),
                message: format!("invalid data file path {:?}", bad),
            }
            .into());
        }

        self.files.extend(paths.iter().cloned());
        self.summary
            .extend(snapshot_props.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.overwrite |= overwrite;
        Ok(())
    }

    /// Files added so far.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Publish the added files.
    pub async fn commit(self) -> Result<CommitResult> {
        let ident = self.table.ident.clone();
        if self.files.is_empty() {
            return Err(CommitError::AddFiles {
                table: ident.to_string(),
                message: "no files to commit".into(),
            }
            .into());
        }

        let mut summary = self.summary;
        summary.insert(
            SUMMARY_OPERATION.to_string(),
            if self.overwrite { "overwrite" } else { "append" }.to_string(),
        );
        summary.insert(
            SUMMARY_ADDED_DATA_FILES.to_string(),
            self.files.len().to_string(),
        );

        let commit = FileCommit {
            expected_snapshot_id: self.table.current_snapshot_id,
            files: self.files,
            summary,
            overwrite: self.overwrite,
        };

        debug!(table = %ident, files = commit.files.len(), "Committing transaction");
        self.catalog.commit_files(&ident, commit).await
    }
}

/// Trait for creating catalog instances.
#[async_trait]
pub trait CatalogFactory: Send + Sync {
    /// Create a new catalog instance.
    async fn create(&self, config: &DestinationConfig) -> Result<Arc<dyn CatalogOperations>>;

    /// Get the catalog type this factory creates.
    fn catalog_type(&self) -> CatalogType;

    /// Check if this factory supports the given configuration.
    fn supports(&self, config: &DestinationConfig) -> bool {
        self.catalog_type() == config.catalog_type
    }
}

/// Registry of catalog factories.
pub struct CatalogFactoryRegistry {
    factories: Vec<Box<dyn CatalogFactory>>,
}

impl CatalogFactoryRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Create a registry with the REST, Glue and in-memory factories.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(super::rest::RestCatalogFactory));
        registry.register(Box::new(super::glue::GlueCatalogFactory));
        registry.register(Box::new(super::memory::MemoryCatalogFactory));
        registry
    }

    /// Register a new catalog factory.
    pub fn register(&mut self, factory: Box<dyn CatalogFactory>) {
        self.factories.push(factory);
    }

    /// Create a catalog instance based on configuration.
    pub async fn create(&self, config: &DestinationConfig) -> Result<Arc<dyn CatalogOperations>> {
        for factory in &self.factories {
            if factory.supports(config) {
                return factory.create(config).await;
            }
        }

        Err(Error::Config(format!(
            "No catalog factory found for catalog type: {:?}",
            config.catalog_type
        )))
    }

    /// Get the supported catalog types.
    pub fn supported_types(&self) -> Vec<CatalogType> {
        self.factories.iter().map(|f| f.catalog_type()).collect()
    }
}

impl Default for CatalogFactoryRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
