//! Manifest files.
//!
//! A snapshot points at a manifest list, the list points at manifests, and
//! each manifest lists data files. Both are Avro object container files using
//! the format v2 schemas. Tables written here are unpartitioned, so every
//! manifest uses partition spec 0 and an empty partition tuple.
//!
//! [`SnapshotProducer`] writes one manifest for the files of a commit and a
//! manifest list that also carries the parent snapshot's manifests forward.

use crate::error::{CommitError, WriteError};
use crate::event::TableIdent;
use crate::iceberg::catalog::{FileCommit, SUMMARY_OPERATION};
use crate::iceberg::metadata::{Snapshot, TableMetadata};
use crate::iceberg::storage::Storage;
use crate::{Error, Result};
use apache_avro::types::Value;
use apache_avro::{Reader, Schema as AvroSchema, Writer};
use bytes::Bytes;
use futures::future::try_join_all;
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::fmt::Display;
use tracing::debug;
use uuid::Uuid;

/// Snapshot summary key recording the rows a commit added.
pub const SUMMARY_ADDED_RECORDS: &str = "added-records";
/// Snapshot summary key recording the bytes a commit added.
pub const SUMMARY_ADDED_FILES_SIZE: &str = "added-files-size";

const STATUS_ADDED: i32 = 1;
const CONTENT_DATA: i32 = 0;
const FILE_FORMAT: &str = "PARQUET";

const MANIFEST_ENTRY_SCHEMA: &str = r#"{
  "type": "record",
  "name": "manifest_entry",
  "fields": [
    {"name": "status", "type": "int", "field-id": 0},
    {"name": "snapshot_id", "type": ["null", "long"], "default": null, "field-id": 1},
    {"name": "sequence_number", "type": ["null", "long"], "default": null, "field-id": 3},
    {"name": "file_sequence_number", "type": ["null", "long"], "default": null, "field-id": 4},
    {"name": "data_file", "field-id": 2, "type": {
      "type": "record",
      "name": "r2",
      "fields": [
        {"name": "content", "type": "int", "field-id": 134},
        {"name": "file_path", "type": "string", "field-id": 100},
        {"name": "file_format", "type": "string", "field-id": 101},
        {"name": "partition", "field-id": 102, "type": {"type": "record", "name": "r102", "fields": []}},
        {"name": "record_count", "type": "long", "field-id": 103},
        {"name": "file_size_in_bytes", "type": "long", "field-id": 104}
      ]
    }}
  ]
}"#;

const MANIFEST_FILE_SCHEMA: &str = r#"{
  "type": "record",
  "name": "manifest_file",
  "fields": [
    {"name": "manifest_path", "type": "string", "field-id": 500},
    {"name": "manifest_length", "type": "long", "field-id": 501},
    {"name": "partition_spec_id", "type": "int", "field-id": 502},
    {"name": "content", "type": "int", "field-id": 517},
    {"name": "sequence_number", "type": "long", "field-id": 515},
    {"name": "min_sequence_number", "type": "long", "field-id": 516},
    {"name": "added_snapshot_id", "type": "long", "field-id": 503},
    {"name": "added_files_count", "type": "int", "field-id": 504},
    {"name": "existing_files_count", "type": "int", "field-id": 505},
    {"name": "deleted_files_count", "type": "int", "field-id": 506},
    {"name": "added_rows_count", "type": "long", "field-id": 512},
    {"name": "existing_rows_count", "type": "long", "field-id": 513},
    {"name": "deleted_rows_count", "type": "long", "field-id": 514}
  ]
}"#;

/// Data file listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileEntry {
    pub file_path: String,
    pub record_count: i64,
    pub file_size_in_bytes: i64,
}

/// Manifest listed in a manifest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub manifest_path: String,
    pub manifest_length: i64,
    pub partition_spec_id: i32,
    pub content: i32,
    pub sequence_number: i64,
    pub min_sequence_number: i64,
    pub added_snapshot_id: i64,
    pub added_files_count: i32,
    pub existing_files_count: i32,
    pub deleted_files_count: i32,
    pub added_rows_count: i64,
    pub existing_rows_count: i64,
    pub deleted_rows_count: i64,
}

/// Random positive snapshot ID.
pub fn new_snapshot_id() -> i64 {
    let bits = Uuid::new_v4().as_u128();
    let id = ((bits >> 64) as u64 ^ bits as u64) & i64::MAX as u64;
    id.max(1) as i64
}

/// Row count and size of a data file, read from its Parquet footer.
pub async fn inspect_data_file(storage: &Storage, path: &str) -> Result<DataFileEntry> {
    let read_error = |message: String| WriteError::Read {
        path: path.to_string(),
        message,
    };

    let key = storage
        .key_of(path)
        .ok_or_else(|| read_error(format!("outside storage prefix {}", storage.prefix())))?;
    let data = storage.get(&key).await?;
    let file_size_in_bytes = data.len() as i64;

    let reader = SerializedFileReader::new(data).map_err(|e| read_error(e.to_string()))?;
    Ok(DataFileEntry {
        file_path: path.to_string(),
        record_count: reader.metadata().file_metadata().num_rows(),
        file_size_in_bytes,
    })
}

fn long_union(value: Option<i64>) -> Value {
    match value {
        Some(v) => Value::Union(1, Box::new(Value::Long(v))),
        None => Value::Union(0, Box::new(Value::Null)),
    }
}

fn manifest_entry(entry: &DataFileEntry, snapshot_id: i64, sequence_number: i64) -> Value {
    Value::Record(vec![
        ("status".into(), Value::Int(STATUS_ADDED)),
        ("snapshot_id".into(), long_union(Some(snapshot_id))),
        ("sequence_number".into(), long_union(Some(sequence_number))),
        ("file_sequence_number".into(), long_union(Some(sequence_number))),
        (
            "data_file".into(),
            Value::Record(vec![
                ("content".into(), Value::Int(CONTENT_DATA)),
                ("file_path".into(), Value::String(entry.file_path.clone())),
                ("file_format".into(), Value::String(FILE_FORMAT.into())),
                ("partition".into(), Value::Record(Vec::new())),
                ("record_count".into(), Value::Long(entry.record_count)),
                ("file_size_in_bytes".into(), Value::Long(entry.file_size_in_bytes)),
            ]),
        ),
    ])
}

fn manifest_file(manifest: &ManifestFile) -> Value {
    Value::Record(vec![
        ("manifest_path".into(), Value::String(manifest.manifest_path.clone())),
        ("manifest_length".into(), Value::Long(manifest.manifest_length)),
        ("partition_spec_id".into(), Value::Int(manifest.partition_spec_id)),
        ("content".into(), Value::Int(manifest.content)),
        ("sequence_number".into(), Value::Long(manifest.sequence_number)),
        ("min_sequence_number".into(), Value::Long(manifest.min_sequence_number)),
        ("added_snapshot_id".into(), Value::Long(manifest.added_snapshot_id)),
        ("added_files_count".into(), Value::Int(manifest.added_files_count)),
        ("existing_files_count".into(), Value::Int(manifest.existing_files_count)),
        ("deleted_files_count".into(), Value::Int(manifest.deleted_files_count)),
        ("added_rows_count".into(), Value::Long(manifest.added_rows_count)),
        ("existing_rows_count".into(), Value::Long(manifest.existing_rows_count)),
        ("deleted_rows_count".into(), Value::Long(manifest.deleted_rows_count)),
    ])
}

/// Encode a manifest of newly added data files.
pub fn encode_manifest(
    schema_json: &str,
    schema_id: i32,
    snapshot_id: i64,
    sequence_number: i64,
    entries: &[DataFileEntry],
) -> Result<Vec<u8>> {
    let schema = AvroSchema::parse_str(MANIFEST_ENTRY_SCHEMA)?;
    let mut writer = Writer::new(&schema, Vec::new());
    writer.add_user_metadata("schema".to_string(), schema_json)?;
    writer.add_user_metadata("schema-id".to_string(), schema_id.to_string())?;
    writer.add_user_metadata("partition-spec".to_string(), "[]")?;
    writer.add_user_metadata("partition-spec-id".to_string(), "0")?;
    writer.add_user_metadata("format-version".to_string(), "2")?;
    writer.add_user_metadata("content".to_string(), "data")?;

    for entry in entries {
        writer.append(manifest_entry(entry, snapshot_id, sequence_number))?;
    }
    Ok(writer.into_inner()?)
}

/// Encode a manifest list.
pub fn encode_manifest_list(
    snapshot_id: i64,
    parent_snapshot_id: Option<i64>,
    sequence_number: i64,
    manifests: &[ManifestFile],
) -> Result<Vec<u8>> {
    let schema = AvroSchema::parse_str(MANIFEST_FILE_SCHEMA)?;
    let mut writer = Writer::new(&schema, Vec::new());
    writer.add_user_metadata("snapshot-id".to_string(), snapshot_id.to_string())?;
    writer.add_user_metadata(
        "parent-snapshot-id".to_string(),
        parent_snapshot_id.map_or_else(|| "null".to_string(), |id| id.to_string()),
    )?;
    writer.add_user_metadata("sequence-number".to_string(), sequence_number.to_string())?;
    writer.add_user_metadata("format-version".to_string(), "2")?;

    for manifest in manifests {
        writer.append(manifest_file(manifest))?;
    }
    Ok(writer.into_inner()?)
}

/// Data files of a manifest.
pub fn decode_manifest(data: &[u8]) -> Result<Vec<DataFileEntry>> {
    let mut entries = Vec::new();
    for value in Reader::new(data)? {
        let value = value?;
        let data_file = record(field(record(&value)?, "data_file")?)?;
        entries.push(DataFileEntry {
            file_path: string(field(data_file, "file_path")?)?,
            record_count: long(field(data_file, "record_count")?)?,
            file_size_in_bytes: long(field(data_file, "file_size_in_bytes")?)?,
        });
    }
    Ok(entries)
}

/// Manifests of a manifest list.
///
/// Format v1 lists lack content and sequence numbers and name the counts
/// `*_data_files_count`; missing values read as zero.
pub fn decode_manifest_list(data: &[u8]) -> Result<Vec<ManifestFile>> {
    let mut manifests = Vec::new();
    for value in Reader::new(data)? {
        let value = value?;
        let fields = record(&value)?;
        let int_or_zero = |names: &[&str]| -> Result<i32> {
            names
                .iter()
                .find_map(|name| optional_field(fields, name))
                .map_or(Ok(0), int)
        };
        let long_or_zero = |name: &str| -> Result<i64> {
            optional_field(fields, name).map_or(Ok(0), long)
        };

        manifests.push(ManifestFile {
            manifest_path: string(field(fields, "manifest_path")?)?,
            manifest_length: long(field(fields, "manifest_length")?)?,
            partition_spec_id: int(field(fields, "partition_spec_id")?)?,
            content: int_or_zero(&["content"])?,
            sequence_number: long_or_zero("sequence_number")?,
            min_sequence_number: long_or_zero("min_sequence_number")?,
            added_snapshot_id: long(field(fields, "added_snapshot_id")?)?,
            added_files_count: int_or_zero(&["added_files_count", "added_data_files_count"])?,
            existing_files_count: int_or_zero(&[
                "existing_files_count",
                "existing_data_files_count",
            ])?,
            deleted_files_count: int_or_zero(&[
                "deleted_files_count",
                "deleted_data_files_count",
            ])?,
            added_rows_count: long_or_zero("added_rows_count")?,
            existing_rows_count: long_or_zero("existing_rows_count")?,
            deleted_rows_count: long_or_zero("deleted_rows_count")?,
        });
    }
    Ok(manifests)
}

fn malformed(what: &str, value: &Value) -> Error {
    Error::Serialization(format!("avro: expected {}, found {:?}", what, value))
}

fn optional_field<'a>(fields: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
}

fn field<'a>(fields: &'a [(String, Value)], name: &str) -> Result<&'a Value> {
    optional_field(fields, name)
        .ok_or_else(|| Error::Serialization(format!("avro: missing field {}", name)))
}

fn record(value: &Value) -> Result<&[(String, Value)]> {
    match value {
        Value::Record(fields) => Ok(fields),
        Value::Union(_, inner) => record(inner),
        other => Err(malformed("record", other)),
    }
}

fn long(value: &Value) -> Result<i64> {
    match value {
        Value::Long(v) => Ok(*v),
        Value::Int(v) => Ok(i64::from(*v)),
        Value::Union(_, inner) => long(inner),
        other => Err(malformed("long", other)),
    }
}

fn int(value: &Value) -> Result<i32> {
    match value {
        Value::Int(v) => Ok(*v),
        Value::Union(_, inner) => int(inner),
        other => Err(malformed("int", other)),
    }
}

fn string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Union(_, inner) => string(inner),
        other => Err(malformed("string", other)),
    }
}

/// Writes the manifest and manifest list of a new snapshot.
///
/// Files go under `<namespace>/<table>/metadata/` of the storage prefix, next
/// to the data files the writer produced.
pub struct SnapshotProducer<'a> {
    storage: &'a Storage,
    ident: &'a TableIdent,
    metadata: &'a TableMetadata,
}

impl<'a> SnapshotProducer<'a> {
    /// Producer for a child of the table's current snapshot.
    pub fn new(storage: &'a Storage, ident: &'a TableIdent, metadata: &'a TableMetadata) -> Self {
        Self {
            storage,
            ident,
            metadata,
        }
    }

    fn metadata_key(&self, file: &str) -> String {
        format!("{}/{}/metadata/{}", self.ident.namespace, self.ident.name, file)
    }

    fn manifest_error(&self, message: impl Display) -> Error {
        CommitError::Manifest {
            table: self.ident.to_string(),
            message: message.to_string(),
        }
        .into()
    }

    /// Write the manifest files for `commit` and describe the new snapshot.
    ///
    /// Fails with `CommitError::Conflict` when the table moved past the
    /// snapshot the commit expects; nothing is written in that case.
    pub async fn produce(&self, commit: &FileCommit) -> Result<Snapshot> {
        let parent_snapshot_id = self.metadata.snapshot_id();
        if parent_snapshot_id != commit.expected_snapshot_id {
            return Err(CommitError::Conflict {
                table: self.ident.to_string(),
                expected: commit.expected_snapshot_id,
            }
            .into());
        }

        let schema = self
            .metadata
            .current_schema()
            .ok_or_else(|| self.manifest_error("table has no schema"))?;
        let schema_json = serde_json::to_string(schema)?;
        let snapshot_id = new_snapshot_id();
        let sequence_number = self.metadata.last_sequence_number + 1;

        let entries = try_join_all(
            commit
                .files
                .iter()
                .map(|path| inspect_data_file(self.storage, path)),
        )
        .await?;
        let added_rows: i64 = entries.iter().map(|e| e.record_count).sum();
        let added_bytes: i64 = entries.iter().map(|e| e.file_size_in_bytes).sum();

        let manifest = encode_manifest(
            &schema_json,
            schema.schema_id,
            snapshot_id,
            sequence_number,
            &entries,
        )
        .map_err(|e| self.manifest_error(e))?;
        let manifest_key = self.metadata_key(&format!("{}-m0.avro", Uuid::new_v4()));
        let manifest_length = manifest.len() as i64;
        self.storage.put(&manifest_key, Bytes::from(manifest)).await?;

        let mut manifests = vec![ManifestFile {
            manifest_path: self.storage.location(&manifest_key),
            manifest_length,
            partition_spec_id: 0,
            content: CONTENT_DATA,
            sequence_number,
            min_sequence_number: sequence_number,
            added_snapshot_id: snapshot_id,
            added_files_count: entries.len() as i32,
            existing_files_count: 0,
            deleted_files_count: 0,
            added_rows_count: added_rows,
            existing_rows_count: 0,
            deleted_rows_count: 0,
        }];
        if !commit.overwrite {
            manifests.extend(self.parent_manifests().await?);
        }

        let list = encode_manifest_list(snapshot_id, parent_snapshot_id, sequence_number, &manifests)
            .map_err(|e| self.manifest_error(e))?;
        let list_key = self.metadata_key(&format!("snap-{}-1-{}.avro", snapshot_id, Uuid::new_v4()));
        self.storage.put(&list_key, Bytes::from(list)).await?;

        let mut summary = commit.summary.clone();
        summary.insert(SUMMARY_ADDED_RECORDS.to_string(), added_rows.to_string());
        summary.insert(SUMMARY_ADDED_FILES_SIZE.to_string(), added_bytes.to_string());
        summary
            .entry(SUMMARY_OPERATION.to_string())
            .or_insert_with(|| if commit.overwrite { "overwrite" } else { "append" }.to_string());

        debug!(
            table = %self.ident,
            snapshot_id,
            sequence_number,
            manifests = manifests.len(),
            files = entries.len(),
            "Wrote manifest list"
        );

        Ok(Snapshot {
            snapshot_id,
            parent_snapshot_id,
            sequence_number,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            manifest_list: self.storage.location(&list_key),
            summary,
            schema_id: Some(schema.schema_id),
        })
    }

    async fn parent_manifests(&self) -> Result<Vec<ManifestFile>> {
        let Some(parent_id) = self.metadata.snapshot_id() else {
            return Ok(Vec::new());
        };
        let parent = self
            .metadata
            .current_snapshot()
            .ok_or_else(|| self.manifest_error(format!("snapshot {} missing from metadata", parent_id)))?;

        let key = self.storage.key_of(&parent.manifest_list).ok_or_else(|| {
            self.manifest_error(format!(
                "manifest list {} is outside storage prefix {}",
                parent.manifest_list,
                self.storage.prefix()
            ))
        })?;
        let data = self.storage.get(&key).await?;
        decode_manifest_list(&data).map_err(|e| self.manifest_error(e))
    }
}
