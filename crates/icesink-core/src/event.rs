//! Row-change events delivered by the upstream host.
//!
//! A [`RowEvent`] carries one row (or one control marker) for a destination
//! table together with the source schema the row was produced under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    DropTable,
    TruncateTable,
    InitTableLoad,
    /// This writer finished loading its part of a table
    DoneTableLoad,
    InitShardedTableLoad,
    /// Every writer of the shard finished; snapshot output can be finalized
    DoneShardedTableLoad,
}

impl EventKind {
    /// True for events that carry row data.
    pub fn is_row_event(&self) -> bool {
        matches!(self, EventKind::Insert | EventKind::Update | EventKind::Delete)
    }
}

/// Logical column type as declared by the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceType {
    Int64,
    Int32,
    Int16,
    Int8,
    Uint64,
    Uint32,
    Uint16,
    Uint8,
    Float,
    Double,
    Bytes,
    String,
    Boolean,
    Date,
    Datetime,
    Timestamp,
    Interval,
    /// Dynamic value, stored as JSON text
    Any,
    Other(String),
}

impl SourceType {
    /// Parse a type name, falling back to [`SourceType::Other`].
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "int64" => SourceType::Int64,
            "int32" => SourceType::Int32,
            "int16" => SourceType::Int16,
            "int8" => SourceType::Int8,
            "uint64" => SourceType::Uint64,
            "uint32" => SourceType::Uint32,
            "uint16" => SourceType::Uint16,
            "uint8" => SourceType::Uint8,
            "float" => SourceType::Float,
            "double" => SourceType::Double,
            "bytes" | "string_bytes" => SourceType::Bytes,
            "string" | "utf8" => SourceType::String,
            "boolean" | "bool" => SourceType::Boolean,
            "date" => SourceType::Date,
            "datetime" => SourceType::Datetime,
            "timestamp" => SourceType::Timestamp,
            "interval" => SourceType::Interval,
            "any" => SourceType::Any,
            _ => SourceType::Other(name.to_string()),
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &str {
        match self {
            SourceType::Int64 => "int64",
            SourceType::Int32 => "int32",
            SourceType::Int16 => "int16",
            SourceType::Int8 => "int8",
            SourceType::Uint64 => "uint64",
            SourceType::Uint32 => "uint32",
            SourceType::Uint16 => "uint16",
            SourceType::Uint8 => "uint8",
            SourceType::Float => "float",
            SourceType::Double => "double",
            SourceType::Bytes => "bytes",
            SourceType::String => "string",
            SourceType::Boolean => "boolean",
            SourceType::Date => "date",
            SourceType::Datetime => "datetime",
            SourceType::Timestamp => "timestamp",
            SourceType::Interval => "interval",
            SourceType::Any => "any",
            SourceType::Other(name) => name,
        }
    }
}

impl Serialize for SourceType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SourceType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(SourceType::parse(&name))
    }
}

/// One column of a source table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: SourceType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: SourceType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: false,
            primary_key: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// Ordered source schema of one table.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TableSchema {
    columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Find a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Identity of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct TableIdent {
    pub namespace: String,
    pub name: String,
}

impl TableIdent {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace.name`; the namespace is everything before the last dot.
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.rsplit_once('.')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }

    /// Replace an empty namespace with `default_namespace`.
    pub fn with_default_namespace(mut self, default_namespace: &str) -> Self {
        if self.namespace.is_empty() {
            self.namespace = default_namespace.to_string();
        }
        self
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    #[serde(skip_deserializing)]
    Bytes(Vec<u8>),
    #[serde(skip_deserializing)]
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical JSON form of the value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::UInt(u) => serde_json::Value::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|x| serde_json::Value::from(*x)).collect())
            }
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

/// A row-change event or a control marker for one destination table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RowEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub namespace: String,
    pub table: String,
    #[serde(default)]
    pub column_names: Vec<String>,
    #[serde(default)]
    pub column_values: Vec<Value>,
    #[serde(default)]
    pub table_schema: Option<Arc<TableSchema>>,
}

impl RowEvent {
    /// Build an insert event.
    pub fn insert(
        namespace: impl Into<String>,
        table: impl Into<String>,
        schema: Arc<TableSchema>,
        columns: Vec<(&str, Value)>,
    ) -> Self {
        let (column_names, column_values) = columns
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .unzip();
        Self {
            kind: EventKind::Insert,
            namespace: namespace.into(),
            table: table.into(),
            column_names,
            column_values,
            table_schema: Some(schema),
        }
    }

    /// Build a control or DDL event carrying no row data.
    pub fn control(
        kind: EventKind,
        namespace: impl Into<String>,
        table: impl Into<String>,
        schema: Option<Arc<TableSchema>>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            table: table.into(),
            column_names: Vec::new(),
            column_values: Vec::new(),
            table_schema: schema,
        }
    }

    pub fn is_row_event(&self) -> bool {
        self.kind.is_row_event()
    }

    /// Table identity as addressed by the event.
    pub fn table_ident(&self) -> TableIdent {
        TableIdent::new(self.namespace.clone(), self.table.clone())
    }

    /// Value for `name`, if the row has one.
    pub fn value(&self, name: &str) -> Option<&Value> {
        let idx = self.column_names.iter().position(|c| c == name)?;
        self.column_values.get(idx)
    }

    /// Declared source type of column `name`.
    pub fn source_type(&self, name: &str) -> Option<&SourceType> {
        self.table_schema
            .as_ref()
            .and_then(|s| s.column(name))
            .map(|c| &c.data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_row_events() {
        assert!(EventKind::Insert.is_row_event());
        assert!(EventKind::Delete.is_row_event());
        assert!(!EventKind::DoneTableLoad.is_row_event());
        assert!(!EventKind::TruncateTable.is_row_event());
    }

    #[test]
    fn test_source_type_parse() {
        assert_eq!(SourceType::parse("INT64"), SourceType::Int64);
        assert_eq!(SourceType::parse("utf8"), SourceType::String);
        assert_eq!(
            SourceType::parse("decimal"),
            SourceType::Other("decimal".into())
        );
    }

    #[test]
    fn test_table_ident() {
        let ident = TableIdent::new("", "orders").with_default_namespace("default");
        assert_eq!(ident.to_string(), "default.orders");

        let parsed = TableIdent::parse("sales.eu.orders").unwrap();
        assert_eq!(parsed.namespace, "sales.eu");
        assert_eq!(parsed.name, "orders");
        assert!(TableIdent::parse("orders").is_none());
    }

    #[test]
    fn test_row_event_from_json_line() {
        let line = r#"{
            "kind": "insert",
            "namespace": "db",
            "table": "users",
            "column_names": ["id", "name", "tags"],
            "column_values": [1, "alice", {"a": [1, 2]}],
            "table_schema": [
                {"name": "id", "data_type": "int64", "required": true, "primary_key": true},
                {"name": "name", "data_type": "utf8"},
                {"name": "tags", "data_type": "any"}
            ]
        }"#;
        let event: RowEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.kind, EventKind::Insert);
        assert_eq!(event.value("id"), Some(&Value::Int(1)));
        assert_eq!(event.value("name"), Some(&Value::String("alice".into())));
        assert!(matches!(event.value("tags"), Some(Value::Json(_))));
        assert_eq!(event.source_type("tags"), Some(&SourceType::Any));
        assert_eq!(event.value("missing"), None);
    }
}
