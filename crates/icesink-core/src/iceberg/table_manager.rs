//! Table lifecycle management.
//!
//! Handles table operations:
//! - Create table on first use from the mapped source schema
//! - Load table metadata
//! - Drop and truncate (drop + recreate empty)

use crate::error::DdlError;
use crate::event::{TableIdent, TableSchema};
use crate::iceberg::catalog::{CatalogOperations, TableInfo};
use crate::iceberg::type_mapper::{map_schema, DestinationSchema};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Destructive table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    /// Remove the table
    Drop,
    /// Remove all data, keep the table
    Truncate,
}

/// Ensures tables exist and applies drop/truncate.
pub struct TableLifecycleManager {
    catalog: Arc<dyn CatalogOperations>,
    /// Properties given to created tables
    properties: HashMap<String, String>,
}

/// Builder for TableLifecycleManager.
#[derive(Default)]
pub struct TableLifecycleManagerBuilder {
    catalog: Option<Arc<dyn CatalogOperations>>,
    properties: HashMap<String, String>,
}

impl TableLifecycleManagerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the catalog.
    pub fn catalog(mut self, catalog: Arc<dyn CatalogOperations>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the properties of created tables.
    pub fn properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    /// Build the manager.
    pub fn build(self) -> Result<TableLifecycleManager> {
        let catalog = self
            .catalog
            .ok_or_else(|| Error::Config("TableLifecycleManager requires a catalog".into()))?;

        Ok(TableLifecycleManager {
            catalog,
            properties: self.properties,
        })
    }
}

impl TableLifecycleManager {
    /// Create a builder.
    pub fn builder() -> TableLifecycleManagerBuilder {
        TableLifecycleManagerBuilder::new()
    }

    /// Catalog the manager operates on.
    pub fn catalog(&self) -> &Arc<dyn CatalogOperations> {
        &self.catalog
    }

    /// Load a table, creating it from `schema` when it does not exist.
    ///
    /// An existing table is returned as loaded; its columns are not compared
    /// with `schema`. Losing a creation race to another writer counts as
    /// success.
    pub async fn ensure_table(
        &self,
        ident: &TableIdent,
        schema: Option<&TableSchema>,
    ) -> Result<TableInfo> {
        match self.catalog.load_table(ident).await {
            Ok(table) => {
                debug!(table = %ident, snapshot_id = ?table.current_snapshot_id, "Loaded table");
                return Ok(table);
            }
            Err(e) if e.is_table_not_found() => {}
            Err(e) => return Err(e),
        }

        let mapped = map_schema(schema, &ident.to_string())?;
        info!(table = %ident, fields = mapped.fields.len(), "Table does not exist, creating");

        match self.catalog.create_table(ident, &mapped, &self.properties).await {
            Ok(table) => Ok(table),
            Err(e) if e.is_table_already_exists() => {
                debug!(table = %ident, "Table created concurrently, loading");
                self.catalog.load_table(ident).await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a table, recreating it empty for [`DdlKind::Truncate`].
    ///
    /// A missing table is left alone. The recreated table uses `schema` when
    /// given and otherwise the column layout of the dropped table.
    pub async fn drop_or_truncate(
        &self,
        ident: &TableIdent,
        kind: DdlKind,
        schema: Option<&TableSchema>,
    ) -> Result<()> {
        let existing = match self.catalog.load_table(ident).await {
            Ok(table) => table,
            Err(e) if e.is_table_not_found() => {
                debug!(table = %ident, ?kind, "Table does not exist, nothing to do");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let recreate_schema: Option<DestinationSchema> = match (kind, schema) {
            (DdlKind::Drop, _) => None,
            (DdlKind::Truncate, Some(source)) => Some(map_schema(Some(source), &ident.to_string())?),
            (DdlKind::Truncate, None) => Some(existing.schema.clone()),
        };

        self.catalog
            .drop_table(ident)
            .await
            .map_err(|e| DdlError::Drop {
                table: ident.to_string(),
                message: e.to_string(),
            })?;
        info!(table = %ident, "Dropped table");

        if let Some(schema) = recreate_schema {
            self.catalog
                .create_table(ident, &schema, &self.properties)
                .await
                .map_err(|e| DdlError::Recreate {
                    table: ident.to_string(),
                    message: e.to_string(),
                })?;
            info!(table = %ident, "Recreated truncated table");
        }

        Ok(())
    }
}
