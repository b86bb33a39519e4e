//! Iceberg REST catalog wire types.
//!
//! The subset of the Apache Iceberg REST Catalog API used by the REST client.
//! See: https://iceberg.apache.org/spec/#iceberg-rest-catalog-api

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use crate::iceberg::metadata::{Schema, SchemaField, Snapshot, TableMetadata};

/// Create namespace request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNamespaceRequest {
    /// Namespace identifier (multi-part)
    pub namespace: Vec<String>,
    /// Namespace properties
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Table identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableIdentifier {
    /// Namespace
    pub namespace: Vec<String>,
    /// Table name
    pub name: String,
}

/// Create table request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableRequest {
    /// Table name
    pub name: String,
    /// Table location (catalog assigns if not provided)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Table schema
    pub schema: Schema,
    /// Table properties
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Load table response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTableResponse {
    /// Metadata location
    #[serde(rename = "metadata-location", default)]
    pub metadata_location: Option<String>,
    /// Table metadata
    pub metadata: TableMetadata,
}

/// Commit table request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitTableRequest {
    /// Identifier (optional for v1)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<TableIdentifier>,
    /// Requirements for optimistic concurrency
    pub requirements: Vec<TableRequirement>,
    /// Updates to apply
    pub updates: Vec<TableUpdate>,
}

/// Table requirement for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TableRequirement {
    /// Table must not exist yet
    #[serde(rename = "assert-create")]
    AssertCreate,
    /// Ref must point at the given snapshot (`None` = ref must not exist)
    #[serde(rename = "assert-ref-snapshot-id")]
    AssertRefSnapshotId {
        #[serde(rename = "ref")]
        ref_name: String,
        #[serde(rename = "snapshot-id")]
        snapshot_id: Option<i64>,
    },
}

/// Table metadata update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum TableUpdate {
    /// Add a snapshot
    #[serde(rename = "add-snapshot")]
    AddSnapshot { snapshot: Snapshot },
    /// Set snapshot ref (branch or tag)
    #[serde(rename = "set-snapshot-ref")]
    SetSnapshotRef {
        #[serde(rename = "ref-name")]
        ref_name: String,
        #[serde(rename = "snapshot-id")]
        snapshot_id: i64,
        #[serde(rename = "type")]
        ref_type: String,
    },
}

/// Commit table response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitTableResponse {
    /// Metadata location
    #[serde(rename = "metadata-location")]
    pub metadata_location: String,
    /// Updated metadata
    pub metadata: TableMetadata,
}

/// Error body, either bare or wrapped in an `error` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorBody {
    /// `{"error": {...}}`
    Wrapped { error: ErrorResponse },
    /// `{...}`
    Bare(ErrorResponse),
}

impl ErrorBody {
    /// The error model.
    pub fn into_inner(self) -> ErrorResponse {
        match self {
            ErrorBody::Wrapped { error } => error,
            ErrorBody::Bare(error) => error,
        }
    }
}

/// Error response from REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// HTTP status code
    pub code: i32,
    /// Error message
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnSpec, SourceType, TableSchema};
    use crate::iceberg::type_mapper::{map_schema, IcebergType};

    #[test]
    fn test_schema_from_destination() {
        let source = TableSchema::new(vec![
            ColumnSpec::new("id", SourceType::Int64).required().primary_key(),
            ColumnSpec::new("at", SourceType::Timestamp),
        ]);
        let mapped = map_schema(Some(&source), "t").unwrap();
        let schema = Schema::from(&mapped);

        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["schema-id"], 1);
        assert_eq!(json["type"], "struct");
        assert_eq!(json["fields"][1]["type"], "timestamptz");
        assert_eq!(json["identifier-field-ids"], serde_json::json!([1]));

        assert_eq!(schema.to_destination(), mapped);
    }

    #[test]
    fn test_load_table_v2_metadata() {
        let json = r#"{
            "metadata-location": "s3://b/w/db/t/metadata/00001.metadata.json",
            "metadata": {
                "format-version": 2,
                "location": "s3://b/w/db/t",
                "current-schema-id": 1,
                "schemas": [
                    {"schema-id": 0, "type": "struct", "fields": []},
                    {"schema-id": 1, "type": "struct", "fields": [
                        {"id": 1, "name": "id", "type": "long", "required": true},
                        {"id": 2, "name": "tags", "type": {"type": "list"}, "required": false}
                    ]}
                ],
                "current-snapshot-id": -1,
                "properties": {"owner": "icesink"}
            }
        }"#;

        let response: LoadTableResponse = serde_json::from_str(json).unwrap();
        let metadata = response.metadata;
        assert_eq!(metadata.snapshot_id(), None);

        let schema = metadata.current_schema().unwrap().to_destination();
        assert_eq!(schema.fields.len(), 2);
        assert_eq!(schema.fields[0].field_type, IcebergType::Long);
        assert_eq!(schema.fields[1].field_type, IcebergType::String);
    }

    #[test]
    fn test_commit_request_serialization() {
        let request = CommitTableRequest {
            identifier: None,
            requirements: vec![TableRequirement::AssertRefSnapshotId {
                ref_name: "main".to_string(),
                snapshot_id: Some(99),
            }],
            updates: vec![TableUpdate::SetSnapshotRef {
                ref_name: "main".to_string(),
                snapshot_id: 100,
                ref_type: "branch".to_string(),
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["requirements"][0]["type"], "assert-ref-snapshot-id");
        assert_eq!(json["requirements"][0]["snapshot-id"], 99);
        assert_eq!(json["updates"][0]["action"], "set-snapshot-ref");
        assert_eq!(json["updates"][0]["ref-name"], "main");
    }

    #[test]
    fn test_error_response_deserialization() {
        let wrapped = r#"{"error": {"type": "NoSuchTableException", "code": 404, "message": "Table not found: db.table"}}"#;
        let bare = r#"{"type": "NoSuchTableException", "code": 404, "message": "Table not found: db.table"}"#;

        for body in [wrapped, bare] {
            let error = serde_json::from_str::<ErrorBody>(body).unwrap().into_inner();
            assert_eq!(error.code, 404);
            assert_eq!(error.error_type, "NoSuchTableException");
        }
    }
}
