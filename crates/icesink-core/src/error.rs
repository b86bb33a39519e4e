//! Error types for icesink core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for icesink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for icesink.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source schema error
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Data file write error
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Drop/truncate/create error on an existing table
    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    /// Transaction commit error
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// Shared state store error
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    /// Catalog error
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A blocking call exceeded its deadline
    #[error("Timeout: {operation} did not finish within {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether a failed operation may succeed if attempted again.
    ///
    /// Schema, DDL and configuration problems do not go away on their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Config(_) | Error::Schema(_) | Error::Ddl(_) | Error::Shutdown
        )
    }

    /// Whether this error reports a missing table.
    pub fn is_table_not_found(&self) -> bool {
        matches!(self, Error::Catalog(CatalogError::TableNotFound(_)))
    }

    /// Whether this error reports a table that already exists.
    pub fn is_table_already_exists(&self) -> bool {
        matches!(self, Error::Catalog(CatalogError::TableAlreadyExists(_)))
    }
}

/// Source schema errors.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The event carried no schema
    #[error("schema is missing for table {0}")]
    Missing(String),

    /// The destination schema could not be expressed in Arrow
    #[error("cannot convert schema to Arrow: {0}")]
    ArrowConversion(String),
}

/// Data file write errors.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The storage prefix has no supported object store
    #[error("storage does not support create-for-write: {0}")]
    UnsupportedStorage(String),

    /// Encoding rows into a columnar batch failed
    #[error("encode rows for {table}: {message}")]
    Encode { table: String, message: String },

    /// Parquet serialization failed
    #[error("parquet write {path}: {message}")]
    Parquet { path: String, message: String },

    /// Upload to object storage failed
    #[error("upload {path}: {message}")]
    Upload { path: String, message: String },

    /// Reading back a stored object failed
    #[error("read {path}: {message}")]
    Read { path: String, message: String },
}

/// DDL errors raised after the table existence was confirmed.
#[derive(Error, Debug)]
pub enum DdlError {
    /// Dropping the table failed
    #[error("drop table {table}: {message}")]
    Drop { table: String, message: String },

    /// Recreating the table after a drop failed
    #[error("recreate table {table}: {message}")]
    Recreate { table: String, message: String },
}

/// Transaction commit errors.
#[derive(Error, Debug)]
pub enum CommitError {
    /// Adding files to the transaction failed
    #[error("add files to {table}: {message}")]
    AddFiles { table: String, message: String },

    /// The catalog rejected the commit
    #[error("commit {table}: {message}")]
    Rejected { table: String, message: String },

    /// Another writer committed first
    #[error("concurrent commit on {table}: expected snapshot {expected:?}")]
    Conflict { table: String, expected: Option<i64> },

    /// Writing or reading a manifest file failed
    #[error("manifest for {table}: {message}")]
    Manifest { table: String, message: String },
}

/// Shared state store errors.
#[derive(Error, Debug)]
pub enum StateStoreError {
    /// Reading state failed
    #[error("get state for {scope}: {message}")]
    Get { scope: String, message: String },

    /// Writing state failed
    #[error("set state for {scope}: {message}")]
    Set { scope: String, message: String },

    /// Removing state failed
    #[error("remove state for {scope}: {message}")]
    Remove { scope: String, message: String },

    /// Stored value had an unexpected shape
    #[error("malformed state value under {key}: {message}")]
    Malformed { key: String, message: String },
}

/// Catalog errors.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Catalog connection failed
    #[error("Catalog connection failed: {0}")]
    Connection(String),

    /// Table not found
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table already exists
    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    /// Namespace not found
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Unexpected response from the catalog
    #[error("Unexpected catalog response: {0}")]
    Response(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<apache_avro::Error> for Error {
    fn from(err: apache_avro::Error) -> Self {
        Error::Serialization(format!("avro: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
