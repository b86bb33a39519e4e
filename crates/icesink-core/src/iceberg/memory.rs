//! In-process catalog.
//!
//! Keeps table metadata and committed file lists in memory. Used for local
//! single-process runs (`catalog_type = "memory"`) and as the catalog in tests.

use crate::config::{CatalogType, DestinationConfig};
use crate::error::{CatalogError, CommitError};
use crate::event::TableIdent;
use crate::iceberg::catalog::{
    CatalogFactory, CatalogOperations, CommitResult, FileCommit, TableInfo,
};
use crate::iceberg::type_mapper::DestinationSchema;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Factory for the in-process catalog.
pub struct MemoryCatalogFactory;

#[async_trait]
impl CatalogFactory for MemoryCatalogFactory {
    async fn create(&self, config: &DestinationConfig) -> Result<Arc<dyn CatalogOperations>> {
        Ok(Arc::new(MemoryCatalog::new(config.prefix.clone())))
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Memory
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    info: TableInfo,
    files: Vec<String>,
    snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    files: Vec<String>,
    summary: HashMap<String, String>,
}

/// Catalog holding tables in memory.
pub struct MemoryCatalog {
    warehouse: String,
    tables: RwLock<HashMap<TableIdent, MemoryTable>>,
    next_snapshot_id: AtomicI64,
}

impl MemoryCatalog {
    /// Create an empty catalog placing tables under `warehouse`.
    pub fn new(warehouse: impl Into<String>) -> Self {
        Self {
            warehouse: warehouse.into().trim_end_matches('/').to_string(),
            tables: RwLock::new(HashMap::new()),
            next_snapshot_id: AtomicI64::new(1),
        }
    }

    /// Whether the table exists.
    pub fn contains(&self, ident: &TableIdent) -> bool {
        self.tables.read().contains_key(ident)
    }

    /// Files in the table's current snapshot.
    pub fn committed_files(&self, ident: &TableIdent) -> Vec<String> {
        self.tables
            .read()
            .get(ident)
            .map(|t| t.files.clone())
            .unwrap_or_default()
    }

    /// Number of snapshots committed to the table.
    pub fn snapshot_count(&self, ident: &TableIdent) -> usize {
        self.tables
            .read()
            .get(ident)
            .map(|t| t.snapshots.len())
            .unwrap_or(0)
    }

    /// Files added by each snapshot, oldest first.
    pub fn snapshot_files(&self, ident: &TableIdent) -> Vec<Vec<String>> {
        self.tables
            .read()
            .get(ident)
            .map(|t| t.snapshots.iter().map(|s| s.files.clone()).collect())
            .unwrap_or_default()
    }

    /// Summary of the latest snapshot.
    pub fn last_summary(&self, ident: &TableIdent) -> Option<HashMap<String, String>> {
        self.tables
            .read()
            .get(ident)
            .and_then(|t| t.snapshots.last())
            .map(|s| s.summary.clone())
    }

    /// Names of all tables.
    pub fn table_names(&self) -> Vec<TableIdent> {
        let mut names: Vec<TableIdent> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl CatalogOperations for MemoryCatalog {
    async fn load_table(&self, ident: &TableIdent) -> Result<TableInfo> {
        self.tables
            .read()
            .get(ident)
            .map(|t| t.info.clone())
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()).into())
    }

    async fn create_table(
        &self,
        ident: &TableIdent,
        schema: &DestinationSchema,
        properties: &HashMap<String, String>,
    ) -> Result<TableInfo> {
        let mut tables = self.tables.write();
        if tables.contains_key(ident) {
            return Err(CatalogError::TableAlreadyExists(ident.to_string()).into());
        }

        let info = TableInfo {
            ident: ident.clone(),
            location: format!("{}/{}/{}", self.warehouse, ident.namespace, ident.name),
            current_snapshot_id: None,
            schema: schema.clone(),
            properties: properties.clone(),
        };
        tables.insert(
            ident.clone(),
            MemoryTable {
                info: info.clone(),
                files: Vec::new(),
                snapshots: Vec::new(),
            },
        );

        info!(table = %ident, "Created table");
        Ok(info)
    }

    async fn drop_table(&self, ident: &TableIdent) -> Result<()> {
        self.tables
            .write()
            .remove(ident)
            .map(|_| info!(table = %ident, "Dropped table"))
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()).into())
    }

    async fn commit_files(&self, ident: &TableIdent, commit: FileCommit) -> Result<CommitResult> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(ident)
            .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()))?;

        if table.info.current_snapshot_id != commit.expected_snapshot_id {
            return Err(CommitError::Conflict {
                table: ident.to_string(),
                expected: commit.expected_snapshot_id,
            }
            .into());
        }

        let snapshot_id = self.next_snapshot_id.fetch_add(1, Ordering::SeqCst);
        if commit.overwrite {
            table.files.clear();
        }
        table.files.extend(commit.files.iter().cloned());
        table.snapshots.push(Snapshot {
            files: commit.files.clone(),
            summary: commit.summary,
        });
        table.info.current_snapshot_id = Some(snapshot_id);

        info!(
            table = %ident,
            snapshot_id = snapshot_id,
            files_added = commit.files.len(),
            "Snapshot committed"
        );

        Ok(CommitResult {
            snapshot_id,
            committed_at: chrono::Utc::now(),
            files_added: commit.files.len(),
        })
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnSpec, SourceType, TableSchema};
    use crate::iceberg::type_mapper::map_schema;

    fn schema() -> DestinationSchema {
        let source = TableSchema::new(vec![ColumnSpec::new("id", SourceType::Int64).required()]);
        map_schema(Some(&source), "db.t").unwrap()
    }

    fn commit(expected: Option<i64>, files: &[&str]) -> FileCommit {
        FileCommit {
            expected_snapshot_id: expected,
            files: files.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_load_drop() {
        let catalog = MemoryCatalog::new("/warehouse/");
        let ident = TableIdent::new("db", "t");

        let err = catalog.load_table(&ident).await.unwrap_err();
        assert!(err.is_table_not_found());

        let created = catalog
            .create_table(&ident, &schema(), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(created.location, "/warehouse/db/t");
        assert!(created.current_snapshot_id.is_none());

        let err = catalog
            .create_table(&ident, &schema(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.is_table_already_exists());

        let loaded = catalog.load_table(&ident).await.unwrap();
        assert_eq!(loaded.schema, schema());

        catalog.drop_table(&ident).await.unwrap();
        assert!(!catalog.contains(&ident));
        assert!(catalog.drop_table(&ident).await.unwrap_err().is_table_not_found());
    }

    #[tokio::test]
    async fn test_commit_appends_and_checks_snapshot() {
        let catalog = MemoryCatalog::new("/warehouse");
        let ident = TableIdent::new("db", "t");
        catalog
            .create_table(&ident, &schema(), &HashMap::new())
            .await
            .unwrap();

        let first = catalog
            .commit_files(&ident, commit(None, &["a.parquet"]))
            .await
            .unwrap();
        catalog
            .commit_files(&ident, commit(Some(first.snapshot_id), &["b.parquet"]))
            .await
            .unwrap();
        assert_eq!(catalog.committed_files(&ident), vec!["a.parquet", "b.parquet"]);
        assert_eq!(catalog.snapshot_count(&ident), 2);

        // stale expected snapshot
        let err = catalog
            .commit_files(&ident, commit(Some(first.snapshot_id), &["c.parquet"]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Commit(CommitError::Conflict { .. })));
        assert_eq!(catalog.committed_files(&ident).len(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_files() {
        let catalog = MemoryCatalog::new("/warehouse");
        let ident = TableIdent::new("db", "t");
        catalog
            .create_table(&ident, &schema(), &HashMap::new())
            .await
            .unwrap();

        let first = catalog
            .commit_files(&ident, commit(None, &["a.parquet"]))
            .await
            .unwrap();
        let mut replace = commit(Some(first.snapshot_id), &["b.parquet"]);
        replace.overwrite = true;
        catalog.commit_files(&ident, replace).await.unwrap();

        assert_eq!(catalog.committed_files(&ident), vec!["b.parquet"]);
        assert_eq!(
            catalog.snapshot_files(&ident),
            vec![vec!["a.parquet".to_string()], vec!["b.parquet".to_string()]]
        );
    }
}
