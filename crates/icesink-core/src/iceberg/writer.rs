//! Parquet data file writer.
//!
//! Encodes one batch of rows for a table, serializes it as a single immutable
//! Parquet object, and uploads it under a name that no other writer can
//! produce.
//!
//! ## Write Flow
//!
//! 1. Encode rows into an Arrow RecordBatch with the table's column layout
//! 2. Convert the batch to Parquet bytes
//! 3. Upload the bytes to object storage, retrying with backoff
//! 4. Return the absolute file path for the ledger

use crate::config::{DestinationConfig, ParquetCompression};
use crate::error::WriteError;
use crate::event::{RowEvent, TableIdent};
use crate::iceberg::catalog::TableInfo;
use crate::iceberg::encoder::encode_rows;
use crate::iceberg::storage::Storage;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Writes row batches as Parquet data files.
pub struct DataFileWriter {
    storage: Storage,
    compression: ParquetCompression,
    retry: RetryPolicy,
    write_count: AtomicU64,
}

impl DataFileWriter {
    /// Create a writer over an opened storage prefix.
    pub fn new(storage: Storage, compression: ParquetCompression) -> Self {
        Self {
            storage,
            compression,
            retry: RetryPolicy::default(),
            write_count: AtomicU64::new(0),
        }
    }

    /// Create a writer for the configured prefix.
    pub fn from_config(config: &DestinationConfig) -> Result<Self> {
        let storage = Storage::open(&config.prefix, &config.properties)?;
        Ok(Self::new(storage, config.compression))
    }

    /// Set the retry policy used for uploads.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Storage the writer uploads to.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Number of files written.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Object key of a data file, relative to the storage prefix.
    ///
    /// `<namespace>/<table>/data/{seq/10:05}-{seq%10}-{uuid}-{worker/10000}-{worker%10000:05}.parquet`
    pub fn file_key(ident: &TableIdent, worker: u32, seq: u64, file_id: &Uuid) -> String {
        format!(
            "{}/{}/data/{:05}-{}-{}-{}-{:05}.parquet",
            ident.namespace,
            ident.name,
            seq / 10,
            seq % 10,
            file_id,
            worker / 10000,
            worker % 10000
        )
    }

    /// Write `rows` as one data file and return its path.
    ///
    /// Returns `Ok(None)` without touching storage when there are no rows. The
    /// file name is fixed before the first upload attempt and reused by every
    /// retry.
    pub async fn write(
        &self,
        table: &TableInfo,
        worker: u32,
        seq: u64,
        rows: &[RowEvent],
    ) -> Result<Option<String>> {
        if rows.is_empty() {
            return Ok(None);
        }

        let start = Instant::now();
        let key = Self::file_key(&table.ident, worker, seq, &Uuid::new_v4());
        let path = self.storage.location(&key);

        let batch = encode_rows(rows, &table.schema)?;
        let data = self.convert_to_parquet(&batch, &path)?;
        let file_size = data.len();

        self.retry
            .retry(&format!("upload {}", path), || {
                self.storage.put(&key, data.clone())
            })
            .await?;

        self.write_count.fetch_add(1, Ordering::Relaxed);

        info!(
            table = %table.ident,
            path = %path,
            rows = batch.num_rows(),
            file_size_bytes = file_size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Wrote data file"
        );

        Ok(Some(path))
    }

    /// Convert a RecordBatch to Parquet bytes.
    fn convert_to_parquet(&self, batch: &RecordBatch, path: &str) -> Result<Bytes> {
        let mut buffer = Cursor::new(Vec::new());

        let props = WriterProperties::builder()
            .set_compression(compression_codec(self.compression))
            .set_max_row_group_size(128 * 1024)
            .set_write_batch_size(1024)
            .build();

        let parquet_error = |stage: &str, e: parquet::errors::ParquetError| {
            Error::Write(WriteError::Parquet {
                path: path.to_string(),
                message: format!("{}: {}", stage, e),
            })
        };

        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
            .map_err(|e| parquet_error("create writer", e))?;
        writer
            .write(batch)
            .map_err(|e| parquet_error("write batch", e))?;
        writer.close().map_err(|e| parquet_error("close", e))?;

        debug!(path = %path, rows = batch.num_rows(), "Encoded Parquet");
        Ok(Bytes::from(buffer.into_inner()))
    }
}

fn compression_codec(compression: ParquetCompression) -> Compression {
    match compression {
        ParquetCompression::Snappy => Compression::SNAPPY,
        ParquetCompression::Gzip => Compression::GZIP(Default::default()),
        ParquetCompression::Lz4 => Compression::LZ4,
        ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
        ParquetCompression::None => Compression::UNCOMPRESSED,
    }
}
