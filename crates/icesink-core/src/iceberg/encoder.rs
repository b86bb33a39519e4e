//! Row events to Arrow record batches.
//!
//! One column per destination field, one cell per row. Cells are looked up by
//! column name and coerced according to the destination type; a missing
//! column or a null value becomes a null cell.

use crate::error::WriteError;
use crate::event::{RowEvent, SourceType, Value};
use crate::iceberg::type_mapper::{to_arrow_schema, DestinationField, DestinationSchema, IcebergType};
use crate::Result;
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float32Builder, Float64Builder,
    Int32Builder, Int64Builder, StringBuilder, TimestampMillisecondBuilder,
};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::sync::Arc;
use tracing::{debug, warn};

const SECONDS_PER_DAY: i64 = 86_400;

/// Naive timestamp layouts tried after RFC 3339, in order.
const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Encode rows that target one table into a record batch shaped by `schema`.
pub fn encode_rows(rows: &[RowEvent], schema: &DestinationSchema) -> Result<RecordBatch> {
    let arrow_schema = to_arrow_schema(schema);
    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(arrow_schema));
    }

    let columns: Vec<ArrayRef> = schema
        .fields
        .iter()
        .map(|field| encode_column(rows, field))
        .collect();

    // A required column that received nulls is written as optional rather
    // than failing the whole batch.
    let fields: Vec<Field> = arrow_schema
        .fields()
        .iter()
        .zip(&columns)
        .map(|(field, column)| {
            if !field.is_nullable() && column.null_count() > 0 {
                warn!(
                    field = %field.name(),
                    nulls = column.null_count(),
                    "Required field received null values"
                );
                field.as_ref().clone().with_nullable(true)
            } else {
                field.as_ref().clone()
            }
        })
        .collect();

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(|e| {
        WriteError::Encode {
            table: rows[0].table_ident().to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// The row's value for `name`, or `None` when absent or null.
fn cell<'a>(row: &'a RowEvent, name: &str) -> Option<&'a Value> {
    row.value(name).filter(|v| !v.is_null())
}

fn encode_column(rows: &[RowEvent], field: &DestinationField) -> ArrayRef {
    let name = field.name.as_str();
    match field.field_type {
        IcebergType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(cell(row, name).map(to_bool));
            }
            Arc::new(builder.finish())
        }
        IcebergType::Int => {
            let mut builder = Int32Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(cell(row, name).map(|v| narrow_i32(to_i64(v), name)));
            }
            Arc::new(builder.finish())
        }
        IcebergType::Long => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(cell(row, name).map(to_i64));
            }
            Arc::new(builder.finish())
        }
        IcebergType::Float => {
            let mut builder = Float32Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(cell(row, name).map(|v| to_f64(v) as f32));
            }
            Arc::new(builder.finish())
        }
        IcebergType::Double => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(cell(row, name).map(to_f64));
            }
            Arc::new(builder.finish())
        }
        IcebergType::Date => {
            let mut builder = Date32Builder::with_capacity(rows.len());
            for row in rows {
                builder.append_option(cell(row, name).map(|v| to_date_days(v, name)));
            }
            Arc::new(builder.finish())
        }
        IcebergType::TimestampTz => {
            let mut builder =
                TimestampMillisecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
            for row in rows {
                builder.append_option(cell(row, name).map(|v| to_timestamp_ms(v, name)));
            }
            Arc::new(builder.finish())
        }
        IcebergType::String => {
            let mut builder = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
            for row in rows {
                let rendered = cell(row, name).map(|v| {
                    if row.source_type(name) == Some(&SourceType::Any) {
                        to_json_text(v)
                    } else {
                        to_plain_string(v)
                    }
                });
                builder.append_option(rendered);
            }
            Arc::new(builder.finish())
        }
        IcebergType::Binary => {
            let mut builder = BinaryBuilder::with_capacity(rows.len(), rows.len() * 16);
            for row in rows {
                match cell(row, name) {
                    Some(Value::Bytes(bytes)) => builder.append_value(bytes),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
    }
}

/// Permissive integer coercion; anything unparsable is 0.
pub fn to_i64(value: &Value) -> i64 {
    match value {
        Value::Null => 0,
        Value::Bool(b) => *b as i64,
        Value::Int(i) => *i,
        Value::UInt(u) => *u as i64,
        Value::Float(f) => *f as i64,
        Value::String(s) => parse_i64(s),
        Value::Bytes(_) => 0,
        Value::Timestamp(ts) => ts.timestamp_millis(),
        Value::Json(json) => match json {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_u64().map(|u| u as i64))
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            serde_json::Value::Bool(b) => *b as i64,
            serde_json::Value::String(s) => parse_i64(s),
            _ => 0,
        },
    }
}

fn parse_i64(s: &str) -> i64 {
    let s = s.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        .unwrap_or(0)
}

/// Permissive float coercion; anything unparsable is 0.
pub fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Null | Value::Bytes(_) => 0.0,
        Value::Bool(b) => *b as u8 as f64,
        Value::Int(i) => *i as f64,
        Value::UInt(u) => *u as f64,
        Value::Float(f) => *f,
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Timestamp(ts) => ts.timestamp_millis() as f64,
        Value::Json(json) => match json {
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            serde_json::Value::Bool(b) => *b as u8 as f64,
            serde_json::Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        },
    }
}

/// Boolean coercion: non-zero numbers and `true/t/1` strings are true.
pub fn to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::UInt(u) => *u != 0,
        Value::Float(f) => *f != 0.0,
        Value::String(s) => parse_bool(s),
        Value::Json(serde_json::Value::Bool(b)) => *b,
        Value::Json(serde_json::Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Json(serde_json::Value::String(s)) => parse_bool(s),
        _ => false,
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "t" | "1")
}

/// Natural string rendering of a value.
pub fn to_plain_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Timestamp(ts) => ts.to_rfc3339(),
        Value::Json(serde_json::Value::String(s)) => s.clone(),
        Value::Json(json) => json.to_string(),
    }
}

/// Canonical JSON text of a value.
pub fn to_json_text(value: &Value) -> String {
    // serializing a serde_json::Value cannot fail
    serde_json::to_string(&value.to_json()).unwrap_or_default()
}

/// Narrow to 32 bits, wrapping values out of range.
fn narrow_i32(value: i64, field: &str) -> i32 {
    i32::try_from(value).unwrap_or_else(|_| {
        debug!(field = %field, value, "Value out of i32 range, wrapped");
        value as i32
    })
}

/// Days since the Unix epoch; unparsable input yields day 0.
pub fn to_date_days(value: &Value, field: &str) -> i32 {
    let days = match value {
        Value::Timestamp(ts) => Some(ts.timestamp().div_euclid(SECONDS_PER_DAY)),
        Value::Int(days) => Some(*days),
        Value::UInt(days) => Some(*days as i64),
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .ok()
            .map(days_since_epoch),
        _ => None,
    };

    days.map(|d| narrow_i32(d, field)).unwrap_or_else(|| {
        debug!(field = %field, value = ?value, "Unparsable date, using epoch");
        0
    })
}

/// Milliseconds since the Unix epoch; unparsable input yields 0.
pub fn to_timestamp_ms(value: &Value, field: &str) -> i64 {
    let millis = match value {
        Value::Timestamp(ts) => Some(ts.timestamp_millis()),
        Value::Int(ms) => Some(*ms),
        Value::UInt(ms) => Some(*ms as i64),
        Value::String(s) => parse_timestamp_ms(s.trim()),
        _ => None,
    };

    millis.unwrap_or_else(|| {
        debug!(field = %field, value = ?value, "Unparsable timestamp, using epoch");
        0
    })
}

fn parse_timestamp_ms(s: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.timestamp_millis());
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn days_since_epoch(date: NaiveDate) -> i64 {
    date.signed_duration_since(NaiveDate::default()).num_days()
}
