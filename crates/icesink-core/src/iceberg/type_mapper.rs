//! Source column types to Iceberg primitive types.
//!
//! Builds the destination schema for a new table: one field per source
//! column, field IDs assigned sequentially from 1, identifier fields taken
//! from columns that are both primary key and required.

use crate::error::SchemaError;
use crate::event::{SourceType, TableSchema};
use crate::Result;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use parquet::arrow::PARQUET_FIELD_ID_META_KEY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Schema id given to every freshly mapped schema.
pub const INITIAL_SCHEMA_ID: i32 = 1;

/// Iceberg primitive types produced by the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcebergType {
    /// Boolean type
    Boolean,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit double
    Double,
    /// Date (days since epoch)
    Date,
    /// Timestamp with timezone
    TimestampTz,
    /// String type
    String,
    /// Binary data
    Binary,
}

impl IcebergType {
    /// Iceberg type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            IcebergType::Boolean => "boolean",
            IcebergType::Int => "int",
            IcebergType::Long => "long",
            IcebergType::Float => "float",
            IcebergType::Double => "double",
            IcebergType::Date => "date",
            IcebergType::TimestampTz => "timestamptz",
            IcebergType::String => "string",
            IcebergType::Binary => "binary",
        }
    }

    /// Parse an Iceberg type name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "boolean" => Some(IcebergType::Boolean),
            "int" | "integer" => Some(IcebergType::Int),
            "long" | "bigint" => Some(IcebergType::Long),
            "float" => Some(IcebergType::Float),
            "double" => Some(IcebergType::Double),
            "date" => Some(IcebergType::Date),
            "timestamptz" | "timestamp_tz" => Some(IcebergType::TimestampTz),
            "string" => Some(IcebergType::String),
            "binary" => Some(IcebergType::Binary),
            _ => None,
        }
    }

    /// Destination type for a source column type.
    pub fn from_source(source: &SourceType) -> Self {
        match source {
            SourceType::Int64 => IcebergType::Long,
            SourceType::Int32 | SourceType::Int16 | SourceType::Int8 => IcebergType::Int,
            SourceType::Uint64 | SourceType::Uint32 => IcebergType::Long,
            SourceType::Uint16 | SourceType::Uint8 => IcebergType::Int,
            SourceType::Float => IcebergType::Float,
            SourceType::Double => IcebergType::Double,
            SourceType::Bytes => IcebergType::Binary,
            SourceType::String => IcebergType::String,
            SourceType::Boolean => IcebergType::Boolean,
            SourceType::Date => IcebergType::Date,
            SourceType::Datetime | SourceType::Timestamp => IcebergType::TimestampTz,
            // serialized as JSON text by the encoder
            SourceType::Interval | SourceType::Any | SourceType::Other(_) => IcebergType::String,
        }
    }

    /// Arrow type used for the column in data files.
    pub fn arrow_type(&self) -> DataType {
        match self {
            IcebergType::Boolean => DataType::Boolean,
            IcebergType::Int => DataType::Int32,
            IcebergType::Long => DataType::Int64,
            IcebergType::Float => DataType::Float32,
            IcebergType::Double => DataType::Float64,
            IcebergType::Date => DataType::Date32,
            IcebergType::TimestampTz => {
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
            }
            IcebergType::String => DataType::Utf8,
            IcebergType::Binary => DataType::Binary,
        }
    }
}

impl fmt::Display for IcebergType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for IcebergType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IcebergType {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        IcebergType::parse(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unsupported iceberg type {}", name)))
    }
}

/// One field of a destination schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationField {
    /// Field ID
    pub id: i32,
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: IcebergType,
    /// Whether the field is required
    pub required: bool,
}

/// Ordered destination schema with identifier fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSchema {
    /// Schema ID
    pub schema_id: i32,
    /// Schema fields, in column order
    pub fields: Vec<DestinationField>,
    /// IDs of fields forming the row identity
    pub identifier_field_ids: Vec<i32>,
}

impl DestinationSchema {
    /// Highest assigned field id.
    pub fn last_column_id(&self) -> i32 {
        self.fields.iter().map(|f| f.id).max().unwrap_or(0)
    }

    /// Find a field by name.
    pub fn field(&self, name: &str) -> Option<&DestinationField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Map a source schema to a destination schema.
///
/// Fails with [`SchemaError::Missing`] when there is no schema; `table` only
/// names the table in that error.
pub fn map_schema(schema: Option<&TableSchema>, table: &str) -> Result<DestinationSchema> {
    let schema = schema.ok_or_else(|| SchemaError::Missing(table.to_string()))?;

    let mut fields = Vec::with_capacity(schema.columns().len());
    let mut identifier_field_ids = Vec::new();

    for (idx, column) in schema.columns().iter().enumerate() {
        let id = idx as i32 + 1;
        fields.push(DestinationField {
            id,
            name: column.name.clone(),
            field_type: IcebergType::from_source(&column.data_type),
            required: column.required,
        });

        // identifier fields must be required
        if column.primary_key && column.required {
            identifier_field_ids.push(id);
        }
    }

    Ok(DestinationSchema {
        schema_id: INITIAL_SCHEMA_ID,
        fields,
        identifier_field_ids,
    })
}

/// Arrow schema for a destination schema, carrying Iceberg field IDs.
pub fn to_arrow_schema(schema: &DestinationSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields
        .iter()
        .map(|f| {
            Field::new(&f.name, f.field_type.arrow_type(), !f.required).with_metadata(
                HashMap::from([(PARQUET_FIELD_ID_META_KEY.to_string(), f.id.to_string())]),
            )
        })
        .collect();
    Arc::new(Schema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ColumnSpec;

    fn sample_schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSpec::new("id", SourceType::Int64).required().primary_key(),
            ColumnSpec::new("name", SourceType::String).required(),
            ColumnSpec::new("tag", SourceType::Any),
        ])
    }

    #[test]
    fn test_three_column_mapping() {
        let mapped = map_schema(Some(&sample_schema()), "db.users").unwrap();

        let summary: Vec<(i32, &str, IcebergType)> = mapped
            .fields
            .iter()
            .map(|f| (f.id, f.name.as_str(), f.field_type))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "id", IcebergType::Long),
                (2, "name", IcebergType::String),
                (3, "tag", IcebergType::String),
            ]
        );
        assert_eq!(mapped.identifier_field_ids, vec![1]);
        assert_eq!(mapped.schema_id, INITIAL_SCHEMA_ID);
        assert_eq!(mapped.last_column_id(), 3);
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let schema = sample_schema();
        let first = map_schema(Some(&schema), "t").unwrap();
        let second = map_schema(Some(&schema), "t").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_optional_primary_key_is_not_identifier() {
        let schema = TableSchema::new(vec![
            ColumnSpec::new("a", SourceType::Int32).primary_key(),
            ColumnSpec::new("b", SourceType::Int32).required(),
            ColumnSpec::new("c", SourceType::Int32).required().primary_key(),
        ]);
        let mapped = map_schema(Some(&schema), "t").unwrap();
        assert_eq!(mapped.identifier_field_ids, vec![3]);
    }

    #[test]
    fn test_missing_schema_is_error() {
        let err = map_schema(None, "db.orders").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Schema(SchemaError::Missing(ref t)) if t == "db.orders"
        ));
    }

    #[test]
    fn test_type_table() {
        use IcebergType::*;
        let cases = [
            (SourceType::Int16, Int),
            (SourceType::Int8, Int),
            (SourceType::Uint64, Long),
            (SourceType::Uint32, Long),
            (SourceType::Uint16, Int),
            (SourceType::Uint8, Int),
            (SourceType::Float, Float),
            (SourceType::Double, Double),
            (SourceType::Bytes, Binary),
            (SourceType::Boolean, Boolean),
            (SourceType::Date, Date),
            (SourceType::Datetime, TimestampTz),
            (SourceType::Timestamp, TimestampTz),
            (SourceType::Interval, String),
            (SourceType::Other("decimal".into()), String),
        ];
        for (source, expected) in cases {
            assert_eq!(IcebergType::from_source(&source), expected, "{:?}", source);
        }
    }

    #[test]
    fn test_arrow_schema_carries_field_ids() {
        let mapped = map_schema(Some(&sample_schema()), "t").unwrap();
        let arrow_schema = to_arrow_schema(&mapped);

        assert_eq!(arrow_schema.fields().len(), 3);
        let id_field = arrow_schema.field(0);
        assert!(!id_field.is_nullable());
        assert_eq!(id_field.data_type(), &DataType::Int64);
        assert_eq!(
            id_field.metadata().get(PARQUET_FIELD_ID_META_KEY),
            Some(&"1".to_string())
        );
        assert!(arrow_schema.field(2).is_nullable());
    }

    #[test]
    fn test_iceberg_type_strings() {
        assert_eq!(IcebergType::TimestampTz.to_string(), "timestamptz");
        assert_eq!(IcebergType::parse("LONG"), Some(IcebergType::Long));
        assert_eq!(IcebergType::parse("decimal(10,2)"), None);
    }
}
