//! AWS Glue catalog implementation.
//!
//! Maps Glue databases to namespaces and Glue tables to Iceberg tables. Table
//! metadata lives in `metadata.json` files under the table location; Glue
//! holds the current file in the `metadata_location` parameter. A commit
//! writes a new metadata file and swaps the pointer with `UpdateTable`,
//! guarded by the Glue table version it read.

use crate::config::{
    CatalogType, DestinationConfig, PROP_GLUE_CATALOG_ID, PROP_S3_ACCESS_KEY_ID, PROP_S3_REGION,
    PROP_S3_SECRET_ACCESS_KEY,
};
use crate::error::{CatalogError, CommitError};
use crate::event::TableIdent;
use crate::iceberg::catalog::{
    CatalogFactory, CatalogOperations, CommitResult, FileCommit, TableInfo,
};
use crate::iceberg::manifest::SnapshotProducer;
use crate::iceberg::metadata::{MetadataLogEntry, TableMetadata, FORMAT_VERSION};
use crate::iceberg::storage::Storage;
use crate::iceberg::type_mapper::{DestinationSchema, IcebergType};
use crate::{Error, Result};
use async_trait::async_trait;
use aws_sdk_glue::types::{Column, SerDeInfo, StorageDescriptor, Table, TableInput};
use aws_sdk_glue::Client as GlueClient;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const PARAM_TABLE_TYPE: &str = "table_type";
const PARAM_METADATA_LOCATION: &str = "metadata_location";
const PARAM_PREVIOUS_METADATA_LOCATION: &str = "previous_metadata_location";
const COLUMN_FIELD_ID: &str = "iceberg.field.id";
const COLUMN_FIELD_OPTIONAL: &str = "iceberg.field.optional";

/// Factory for AWS Glue catalog.
pub struct GlueCatalogFactory;

#[async_trait]
impl CatalogFactory for GlueCatalogFactory {
    async fn create(&self, config: &DestinationConfig) -> Result<Arc<dyn CatalogOperations>> {
        let client = GlueCatalogClient::new(config).await?;
        Ok(Arc::new(client))
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Glue
    }
}

/// AWS Glue catalog client configuration.
#[derive(Debug, Clone)]
pub struct GlueClientConfig {
    /// AWS region
    pub region: String,
    /// Warehouse path (S3 location)
    pub warehouse_path: String,
    /// Glue catalog ID (defaults to AWS account ID)
    pub catalog_id: Option<String>,
}

/// AWS Glue catalog client implementation.
pub struct GlueCatalogClient {
    client: GlueClient,
    config: GlueClientConfig,
    storage: Storage,
}

impl GlueCatalogClient {
    /// Create a new AWS Glue catalog client.
    pub async fn new(config: &DestinationConfig) -> Result<Self> {
        let region = config
            .property(PROP_S3_REGION)
            .ok_or_else(|| {
                Error::Config(format!("Glue catalog requires the {} property", PROP_S3_REGION))
            })?
            .to_string();

        let aws_config = Self::build_aws_config(config, &region).await;
        let storage = Storage::open(&config.prefix, &config.properties)?;

        let client_config = GlueClientConfig {
            region: region.clone(),
            warehouse_path: config.prefix.trim_end_matches('/').to_string(),
            catalog_id: config.property(PROP_GLUE_CATALOG_ID).map(str::to_string),
        };

        info!(region = %region, "AWS Glue catalog client initialized");

        Ok(Self {
            client: GlueClient::new(&aws_config),
            config: client_config,
            storage,
        })
    }

    /// Build AWS configuration with credentials.
    async fn build_aws_config(config: &DestinationConfig, region: &str) -> aws_config::SdkConfig {
        let loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));

        if let (Some(access_key), Some(secret_key)) = (
            config.property(PROP_S3_ACCESS_KEY_ID),
            config.property(PROP_S3_SECRET_ACCESS_KEY),
        ) {
            debug!("Using explicit AWS credentials");
            let credentials = aws_credential_types::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "icesink-explicit-credentials",
            );
            loader.credentials_provider(credentials).load().await
        } else {
            debug!("Using default AWS credential chain");
            loader.load().await
        }
    }

    /// Glue configuration in use.
    pub fn config(&self) -> &GlueClientConfig {
        &self.config
    }

    fn table_location(&self, ident: &TableIdent) -> String {
        format!("{}/{}/{}", self.config.warehouse_path, ident.namespace, ident.name)
    }

    /// Key of a new metadata file; `version` orders files of one table.
    fn metadata_key(ident: &TableIdent, version: i64) -> String {
        format!(
            "{}/{}/metadata/{:05}-{}.metadata.json",
            ident.namespace,
            ident.name,
            version,
            Uuid::new_v4()
        )
    }

    /// Write `metadata` as a new file and return its location.
    async fn write_metadata(
        &self,
        ident: &TableIdent,
        version: i64,
        metadata: &TableMetadata,
    ) -> Result<String> {
        let key = Self::metadata_key(ident, version);
        self.storage
            .put(&key, Bytes::from(serde_json::to_vec(metadata)?))
            .await?;
        debug!(table = %ident, key = %key, "Wrote table metadata");
        Ok(self.storage.location(&key))
    }

    async fn read_metadata(&self, location: &str) -> Result<TableMetadata> {
        let key = self.storage.key_of(location).ok_or_else(|| {
            CatalogError::Response(format!(
                "metadata {} is outside storage prefix {}",
                location,
                self.storage.prefix()
            ))
        })?;
        let data = self.storage.get(&key).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn ensure_database(&self, namespace: &str) -> Result<()> {
        let database_input = aws_sdk_glue::types::DatabaseInput::builder()
            .name(namespace)
            .description("Iceberg database created by icesink")
            .location_uri(format!("{}/{}", self.config.warehouse_path, namespace))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build database input: {}", e)))?;

        let result = self
            .client
            .create_database()
            .set_catalog_id(self.config.catalog_id.clone())
            .database_input(database_input)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(namespace = %namespace, "Created Glue database");
                Ok(())
            }
            Err(e) if error_text(&e).contains("AlreadyExistsException") => Ok(()),
            Err(e) => Err(CatalogError::Connection(format!(
                "Failed to create Glue database {}: {}",
                namespace, e
            ))
            .into()),
        }
    }

    async fn get_glue_table(&self, ident: &TableIdent) -> Result<aws_sdk_glue::types::Table> {
        let result = self
            .client
            .get_table()
            .set_catalog_id(self.config.catalog_id.clone())
            .database_name(&ident.namespace)
            .name(&ident.name)
            .send()
            .await;

        match result {
            Ok(output) => output
                .table()
                .cloned()
                .ok_or_else(|| CatalogError::TableNotFound(ident.to_string()).into()),
            Err(e) if is_not_found(&error_text(&e)) => {
                Err(CatalogError::TableNotFound(ident.to_string()).into())
            }
            Err(e) => Err(CatalogError::Connection(format!(
                "Failed to load Glue table {}: {}",
                ident, e
            ))
            .into()),
        }
    }

    fn table_input(
        ident: &TableIdent,
        schema: &DestinationSchema,
        location: &str,
        parameters: HashMap<String, String>,
    ) -> Result<TableInput> {
        TableInput::builder()
            .name(&ident.name)
            .description("Iceberg table created by icesink")
            .storage_descriptor(build_storage_descriptor(schema, location)?)
            .set_parameters(Some(parameters))
            .table_type("EXTERNAL_TABLE")
            .build()
            .map_err(|e| Error::Config(format!("Failed to build table input: {}", e)))
    }
}

/// Full error chain; service exception names only appear in the source errors.
fn error_text<E: std::error::Error>(e: &E) -> String {
    aws_sdk_glue::error::DisplayErrorContext(e).to_string()
}

fn is_not_found(message: &str) -> bool {
    message.contains("EntityNotFoundException")
}

/// Current metadata file of a Glue table.
fn metadata_location<'a>(table: &'a Table, ident: &TableIdent) -> Result<&'a str> {
    table
        .parameters()
        .and_then(|p| p.get(PARAM_METADATA_LOCATION))
        .map(String::as_str)
        .ok_or_else(|| {
            CatalogError::Response(format!(
                "{} is not an Iceberg table: no {} parameter",
                ident, PARAM_METADATA_LOCATION
            ))
            .into()
        })
}

/// `UpdateTable` input pointing a Glue table at a new metadata file.
#[derive(Debug)]
struct MetadataSwap {
    input: TableInput,
    /// Version the update is conditioned on
    version_id: Option<String>,
}

/// Prepare the update from the table as read, keeping its descriptor and
/// parameters and recording the replaced metadata file.
fn swap_metadata(table: &Table, new_location: &str) -> Result<MetadataSwap> {
    let mut parameters = table.parameters().cloned().unwrap_or_default();
    if let Some(previous) =
        parameters.insert(PARAM_METADATA_LOCATION.to_string(), new_location.to_string())
    {
        parameters.insert(PARAM_PREVIOUS_METADATA_LOCATION.to_string(), previous);
    }

    let input = TableInput::builder()
        .name(table.name())
        .set_description(table.description().map(str::to_string))
        .set_storage_descriptor(table.storage_descriptor().cloned())
        .set_parameters(Some(parameters))
        .set_table_type(table.table_type().map(str::to_string))
        .build()
        .map_err(|e| Error::Config(format!("Failed to build table input: {}", e)))?;

    Ok(MetadataSwap {
        input,
        version_id: table.version_id().map(str::to_string),
    })
}

/// Convert an Iceberg type to a Glue column type.
fn iceberg_type_to_glue_type(iceberg_type: IcebergType) -> &'static str {
    match iceberg_type {
        IcebergType::Boolean => "boolean",
        IcebergType::Int => "int",
        IcebergType::Long => "bigint",
        IcebergType::Float => "float",
        IcebergType::Double => "double",
        IcebergType::String => "string",
        IcebergType::Binary => "binary",
        IcebergType::Date => "date",
        IcebergType::TimestampTz => "timestamp",
    }
}

/// Build storage descriptor for table creation.
fn build_storage_descriptor(schema: &DestinationSchema, location: &str) -> Result<StorageDescriptor> {
    let columns = schema
        .fields
        .iter()
        .map(|f| {
            Column::builder()
                .name(&f.name)
                .r#type(iceberg_type_to_glue_type(f.field_type))
                .parameters(COLUMN_FIELD_ID, f.id.to_string())
                .parameters(COLUMN_FIELD_OPTIONAL, (!f.required).to_string())
                .build()
                .map_err(|e| Error::Config(format!("Failed to build column {}: {}", f.name, e)))
        })
        .collect::<Result<Vec<Column>>>()?;

    Ok(StorageDescriptor::builder()
        .set_columns(Some(columns))
        .location(location)
        .input_format("org.apache.iceberg.mr.hive.HiveIcebergInputFormat")
        .output_format("org.apache.iceberg.mr.hive.HiveIcebergOutputFormat")
        .serde_info(
            SerDeInfo::builder()
                .serialization_library("org.apache.iceberg.mr.hive.HiveIcebergSerDe")
                .build(),
        )
        .build())
}

#[async_trait]
impl CatalogOperations for GlueCatalogClient {
    async fn load_table(&self, ident: &TableIdent) -> Result<TableInfo> {
        let table = self.get_glue_table(ident).await?;
        let metadata = self.read_metadata(metadata_location(&table, ident)?).await?;
        metadata.table_info(ident)
    }

    async fn create_table(
        &self,
        ident: &TableIdent,
        schema: &DestinationSchema,
        properties: &HashMap<String, String>,
    ) -> Result<TableInfo> {
        self.ensure_database(&ident.namespace).await?;

        let location = self.table_location(ident);
        let metadata = TableMetadata::new(location.clone(), schema, properties.clone());
        let metadata_location = self.write_metadata(ident, 0, &metadata).await?;

        let mut parameters = properties.clone();
        parameters.insert(PARAM_TABLE_TYPE.to_string(), "ICEBERG".to_string());
        parameters.insert(PARAM_METADATA_LOCATION.to_string(), metadata_location);

        let table_input = Self::table_input(ident, schema, &location, parameters)?;

        let result = self
            .client
            .create_table()
            .set_catalog_id(self.config.catalog_id.clone())
            .database_name(&ident.namespace)
            .table_input(table_input)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %ident, "Created Glue table");
                metadata.table_info(ident)
            }
            Err(e) if error_text(&e).contains("AlreadyExistsException") => {
                Err(CatalogError::TableAlreadyExists(ident.to_string()).into())
            }
            Err(e) => Err(CatalogError::Connection(format!(
                "Failed to create Glue table {}: {}",
                ident, e
            ))
            .into()),
        }
    }

    async fn drop_table(&self, ident: &TableIdent) -> Result<()> {
        let result = self
            .client
            .delete_table()
            .set_catalog_id(self.config.catalog_id.clone())
            .database_name(&ident.namespace)
            .name(&ident.name)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(table = %ident, "Dropped Glue table");
                Ok(())
            }
            Err(e) if is_not_found(&error_text(&e)) => {
                Err(CatalogError::TableNotFound(ident.to_string()).into())
            }
            Err(e) => Err(CatalogError::Connection(format!(
                "Failed to drop Glue table {}: {}",
                ident, e
            ))
            .into()),
        }
    }

    async fn commit_files(&self, ident: &TableIdent, commit: FileCommit) -> Result<CommitResult> {
        let table = self.get_glue_table(ident).await?;
        let current_location = metadata_location(&table, ident)?.to_string();
        let mut metadata = self.read_metadata(&current_location).await?;
        if metadata.format_version < FORMAT_VERSION {
            return Err(CommitError::Rejected {
                table: ident.to_string(),
                message: format!(
                    "format version {} tables are not supported",
                    metadata.format_version
                ),
            }
            .into());
        }

        let snapshot = SnapshotProducer::new(&self.storage, ident, &metadata)
            .produce(&commit)
            .await?;
        let snapshot_id = snapshot.snapshot_id;

        metadata.metadata_log.push(MetadataLogEntry {
            metadata_file: current_location,
            timestamp_ms: metadata.last_updated_ms,
        });
        metadata.add_snapshot(snapshot);
        let new_location = self
            .write_metadata(ident, metadata.last_sequence_number, &metadata)
            .await?;

        // fails if anyone updated the table since it was read
        let swap = swap_metadata(&table, &new_location)?;
        let result = self
            .client
            .update_table()
            .set_catalog_id(self.config.catalog_id.clone())
            .database_name(&ident.namespace)
            .table_input(swap.input)
            .set_version_id(swap.version_id)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(
                    table = %ident,
                    snapshot_id,
                    files_added = commit.files.len(),
                    "Snapshot committed to Glue"
                );
                Ok(CommitResult {
                    snapshot_id,
                    committed_at: chrono::Utc::now(),
                    files_added: commit.files.len(),
                })
            }
            Err(e) if error_text(&e).contains("ConcurrentModificationException") => {
                Err(CommitError::Conflict {
                    table: ident.to_string(),
                    expected: commit.expected_snapshot_id,
                }
                .into())
            }
            Err(e) => Err(CommitError::Rejected {
                table: ident.to_string(),
                message: error_text(&e),
            }
            .into()),
        }
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Glue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::event::{ColumnSpec, SourceType, TableSchema};
    use crate::iceberg::type_mapper::map_schema;

    fn glue_config() -> Config {
        let mut config = Config::local("s3://bucket/warehouse/");
        config.destination.catalog_type = CatalogType::Glue;
        config
            .destination
            .properties
            .insert(PROP_S3_REGION.into(), "us-east-1".into());
        config
            .destination
            .properties
            .insert(PROP_S3_ACCESS_KEY_ID.into(), "test".into());
        config
            .destination
            .properties
            .insert(PROP_S3_SECRET_ACCESS_KEY.into(), "test".into());
        config
    }

    fn schema() -> DestinationSchema {
        let source = TableSchema::new(vec![
            ColumnSpec::new("id", SourceType::Int64).required().primary_key(),
            ColumnSpec::new("name", SourceType::String),
            ColumnSpec::new("at", SourceType::Timestamp),
        ]);
        map_schema(Some(&source), "db.t").unwrap()
    }

    #[test]
    fn test_glue_catalog_factory_type() {
        assert_eq!(GlueCatalogFactory.catalog_type(), CatalogType::Glue);
    }

    #[tokio::test]
    async fn test_glue_catalog_factory_requires_region() {
        let mut config = glue_config();
        config.destination.properties.remove(PROP_S3_REGION);
        let result = GlueCatalogFactory.create(&config.destination).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_glue_catalog_client_creation() {
        let config = glue_config();
        let client = GlueCatalogClient::new(&config.destination).await.unwrap();
        assert_eq!(client.catalog_type(), CatalogType::Glue);
        assert_eq!(client.config().warehouse_path, "s3://bucket/warehouse");
        assert_eq!(client.config().region, "us-east-1");
        assert_eq!(
            client.table_location(&TableIdent::new("db", "t")),
            "s3://bucket/warehouse/db/t"
        );
    }

    #[test]
    fn test_type_conversion() {
        assert_eq!(iceberg_type_to_glue_type(IcebergType::Long), "bigint");
        assert_eq!(iceberg_type_to_glue_type(IcebergType::TimestampTz), "timestamp");
        assert_eq!(iceberg_type_to_glue_type(IcebergType::Date), "date");
        assert_eq!(iceberg_type_to_glue_type(IcebergType::String), "string");
    }

    #[test]
    fn test_storage_descriptor_columns() {
        let descriptor = build_storage_descriptor(&schema(), "s3://bucket/warehouse/db/t").unwrap();
        let columns = descriptor.columns();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].r#type(), Some("bigint"));
        assert_eq!(
            columns[0].parameters().unwrap().get(COLUMN_FIELD_OPTIONAL).map(String::as_str),
            Some("false")
        );
        assert_eq!(descriptor.location(), Some("s3://bucket/warehouse/db/t"));
    }

    #[test]
    fn test_metadata_key_format() {
        let key = GlueCatalogClient::metadata_key(&TableIdent::new("db", "t"), 3);
        assert!(key.starts_with("db/t/metadata/00003-"));
        assert!(key.ends_with(".metadata.json"));
    }

    #[test]
    fn test_metadata_swap_is_conditioned_on_version() {
        let old = "s3://bucket/warehouse/db/t/metadata/00000-a.metadata.json";
        let new = "s3://bucket/warehouse/db/t/metadata/00001-b.metadata.json";
        let mut parameters = HashMap::new();
        parameters.insert(PARAM_TABLE_TYPE.to_string(), "ICEBERG".to_string());
        parameters.insert(PARAM_METADATA_LOCATION.to_string(), old.to_string());

        let table = Table::builder()
            .name("t")
            .version_id("7")
            .table_type("EXTERNAL_TABLE")
            .storage_descriptor(
                build_storage_descriptor(&schema(), "s3://bucket/warehouse/db/t").unwrap(),
            )
            .set_parameters(Some(parameters))
            .build()
            .unwrap();

        let swap = swap_metadata(&table, new).unwrap();
        assert_eq!(swap.version_id.as_deref(), Some("7"));
        assert_eq!(swap.input.name(), "t");
        assert_eq!(swap.input.table_type(), Some("EXTERNAL_TABLE"));
        assert_eq!(swap.input.storage_descriptor().unwrap().columns().len(), 3);

        let params = swap.input.parameters().unwrap();
        assert_eq!(params[PARAM_METADATA_LOCATION], new);
        assert_eq!(params[PARAM_PREVIOUS_METADATA_LOCATION], old);
        assert_eq!(params[PARAM_TABLE_TYPE], "ICEBERG");
    }

    #[test]
    fn test_table_without_metadata_location_rejected() {
        let table = Table::builder().name("t").build().unwrap();
        let err = metadata_location(&table, &TableIdent::new("db", "t")).unwrap_err();
        assert!(matches!(err, Error::Catalog(CatalogError::Response(_))));
    }

    #[tokio::test]
    async fn test_metadata_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = glue_config();
        config.destination.prefix = dir.path().to_str().unwrap().to_string();
        let client = GlueCatalogClient::new(&config.destination).await.unwrap();

        let ident = TableIdent::new("db", "t");
        let metadata = TableMetadata::new(client.table_location(&ident), &schema(), HashMap::new());
        let location = client.write_metadata(&ident, 0, &metadata).await.unwrap();
        assert!(location.contains("/db/t/metadata/00000-"));

        let read = client.read_metadata(&location).await.unwrap();
        assert_eq!(read.table_uuid, metadata.table_uuid);
        assert_eq!(read.table_info(&ident).unwrap().schema, schema());

        assert!(client.read_metadata("s3://elsewhere/m.json").await.is_err());
    }
}
