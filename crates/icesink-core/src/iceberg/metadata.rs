//! Iceberg table metadata.
//!
//! The JSON document a catalog points at (`metadata.json`). The REST catalog
//! returns it in load and commit responses; the Glue catalog stores it as a
//! file next to the table data and keeps only its location in Glue.
//!
//! Fields this crate does not interpret (partition specs, sort orders,
//! statistics) are carried through unchanged.

use crate::error::CatalogError;
use crate::event::TableIdent;
use crate::iceberg::catalog::TableInfo;
use crate::iceberg::type_mapper::{DestinationField, DestinationSchema, IcebergType};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Branch every commit advances.
pub const MAIN_BRANCH: &str = "main";

/// Format version of tables this crate creates and commits to.
pub const FORMAT_VERSION: i32 = 2;

/// Table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Format version (1 or 2)
    #[serde(rename = "format-version")]
    pub format_version: i32,
    /// Unique table identifier
    #[serde(rename = "table-uuid", default, skip_serializing_if = "Option::is_none")]
    pub table_uuid: Option<String>,
    /// Table location
    pub location: String,
    /// Last sequence number
    #[serde(rename = "last-sequence-number", default)]
    pub last_sequence_number: i64,
    /// Last update time (ms)
    #[serde(rename = "last-updated-ms", default)]
    pub last_updated_ms: i64,
    /// Highest assigned column ID
    #[serde(rename = "last-column-id", default)]
    pub last_column_id: i32,
    /// Current schema (format v1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    /// All schemas
    #[serde(default)]
    pub schemas: Vec<Schema>,
    /// Current schema ID
    #[serde(rename = "current-schema-id", default)]
    pub current_schema_id: Option<i32>,
    /// Table properties
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Current snapshot ID
    #[serde(rename = "current-snapshot-id", default)]
    pub current_snapshot_id: Option<i64>,
    /// All snapshots
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// History of current snapshot changes
    #[serde(rename = "snapshot-log", default)]
    pub snapshot_log: Vec<SnapshotLogEntry>,
    /// History of metadata files
    #[serde(rename = "metadata-log", default)]
    pub metadata_log: Vec<MetadataLogEntry>,
    /// Branches and tags
    #[serde(default)]
    pub refs: HashMap<String, SnapshotRef>,
    /// Everything else, written back as read
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TableMetadata {
    /// Metadata of a new, empty, unpartitioned table.
    pub fn new(
        location: impl Into<String>,
        schema: &DestinationSchema,
        properties: HashMap<String, String>,
    ) -> Self {
        let mut extra = serde_json::Map::new();
        extra.insert(
            "partition-specs".into(),
            serde_json::json!([{"spec-id": 0, "fields": []}]),
        );
        extra.insert("default-spec-id".into(), serde_json::json!(0));
        extra.insert("last-partition-id".into(), serde_json::json!(999));
        extra.insert(
            "sort-orders".into(),
            serde_json::json!([{"order-id": 0, "fields": []}]),
        );
        extra.insert("default-sort-order-id".into(), serde_json::json!(0));

        Self {
            format_version: FORMAT_VERSION,
            table_uuid: Some(uuid::Uuid::new_v4().to_string()),
            location: location.into(),
            last_sequence_number: 0,
            last_updated_ms: chrono::Utc::now().timestamp_millis(),
            last_column_id: schema.fields.iter().map(|f| f.id).max().unwrap_or(0),
            schema: None,
            schemas: vec![Schema::from(schema)],
            current_schema_id: Some(schema.schema_id),
            properties,
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
            metadata_log: Vec::new(),
            refs: HashMap::new(),
            extra,
        }
    }

    /// The schema the table currently uses.
    pub fn current_schema(&self) -> Option<&Schema> {
        self.current_schema_id
            .and_then(|id| self.schemas.iter().find(|s| s.schema_id == id))
            .or(self.schema.as_ref())
            .or_else(|| self.schemas.last())
    }

    /// Current snapshot ID, treating `-1` as no snapshot.
    pub fn snapshot_id(&self) -> Option<i64> {
        self.current_snapshot_id.filter(|id| *id >= 0)
    }

    /// The current snapshot, if the table has one.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        let id = self.snapshot_id()?;
        self.snapshots.iter().find(|s| s.snapshot_id == id)
    }

    /// Make `snapshot` the head of the main branch.
    pub fn add_snapshot(&mut self, snapshot: Snapshot) {
        self.last_sequence_number = self.last_sequence_number.max(snapshot.sequence_number);
        self.last_updated_ms = snapshot.timestamp_ms;
        self.current_snapshot_id = Some(snapshot.snapshot_id);
        self.snapshot_log.push(SnapshotLogEntry {
            snapshot_id: snapshot.snapshot_id,
            timestamp_ms: snapshot.timestamp_ms,
        });
        self.refs.insert(
            MAIN_BRANCH.to_string(),
            SnapshotRef {
                snapshot_id: snapshot.snapshot_id,
                ref_type: "branch".to_string(),
            },
        );
        self.snapshots.push(snapshot);
    }

    /// Bind the metadata to a table identity.
    pub fn table_info(&self, ident: &TableIdent) -> Result<TableInfo> {
        let schema = self
            .current_schema()
            .map(Schema::to_destination)
            .ok_or_else(|| CatalogError::Response(format!("table {} has no schema", ident)))?;

        Ok(TableInfo {
            ident: ident.clone(),
            location: self.location.clone(),
            current_snapshot_id: self.snapshot_id(),
            schema,
            properties: self.properties.clone(),
        })
    }
}

/// Iceberg schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Schema ID
    #[serde(rename = "schema-id", default)]
    pub schema_id: i32,
    /// Schema type (always "struct")
    #[serde(rename = "type", default = "default_struct_type")]
    pub r#type: String,
    /// Schema fields
    pub fields: Vec<SchemaField>,
    /// Identifier field IDs
    #[serde(default, rename = "identifier-field-ids")]
    pub identifier_field_ids: Vec<i32>,
}

fn default_struct_type() -> String {
    "struct".to_string()
}

/// Schema field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field ID
    pub id: i32,
    /// Field name
    pub name: String,
    /// Field type (primitive or nested)
    #[serde(rename = "type")]
    pub field_type: serde_json::Value,
    /// Whether field is required
    pub required: bool,
    /// Documentation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl From<&DestinationSchema> for Schema {
    fn from(schema: &DestinationSchema) -> Self {
        Schema {
            schema_id: schema.schema_id,
            r#type: default_struct_type(),
            fields: schema
                .fields
                .iter()
                .map(|f| SchemaField {
                    id: f.id,
                    name: f.name.clone(),
                    field_type: serde_json::Value::String(f.field_type.as_str().to_string()),
                    required: f.required,
                    doc: None,
                })
                .collect(),
            identifier_field_ids: schema.identifier_field_ids.clone(),
        }
    }
}

impl Schema {
    /// Convert to a destination schema.
    ///
    /// Types outside the primitive set written by this crate are read as
    /// strings; the writer only encodes columns it created itself.
    pub fn to_destination(&self) -> DestinationSchema {
        DestinationSchema {
            schema_id: self.schema_id,
            fields: self
                .fields
                .iter()
                .map(|f| DestinationField {
                    id: f.id,
                    name: f.name.clone(),
                    field_type: f
                        .field_type
                        .as_str()
                        .and_then(IcebergType::parse)
                        .unwrap_or(IcebergType::String),
                    required: f.required,
                })
                .collect(),
            identifier_field_ids: self.identifier_field_ids.clone(),
        }
    }
}

/// Snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot ID
    #[serde(rename = "snapshot-id")]
    pub snapshot_id: i64,
    /// Parent snapshot ID
    #[serde(skip_serializing_if = "Option::is_none", rename = "parent-snapshot-id")]
    pub parent_snapshot_id: Option<i64>,
    /// Sequence number
    #[serde(rename = "sequence-number", default)]
    pub sequence_number: i64,
    /// Timestamp (ms)
    #[serde(rename = "timestamp-ms")]
    pub timestamp_ms: i64,
    /// Manifest list location
    #[serde(rename = "manifest-list")]
    pub manifest_list: String,
    /// Snapshot summary
    #[serde(default)]
    pub summary: HashMap<String, String>,
    /// Schema ID
    #[serde(skip_serializing_if = "Option::is_none", rename = "schema-id")]
    pub schema_id: Option<i32>,
}

/// Entry of the snapshot log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLogEntry {
    #[serde(rename = "snapshot-id")]
    pub snapshot_id: i64,
    #[serde(rename = "timestamp-ms")]
    pub timestamp_ms: i64,
}

/// Entry of the metadata log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataLogEntry {
    #[serde(rename = "metadata-file")]
    pub metadata_file: String,
    #[serde(rename = "timestamp-ms")]
    pub timestamp_ms: i64,
}

/// Branch or tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRef {
    #[serde(rename = "snapshot-id")]
    pub snapshot_id: i64,
    #[serde(rename = "type")]
    pub ref_type: String,
}
