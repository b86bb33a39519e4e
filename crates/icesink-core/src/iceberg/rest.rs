//! Iceberg REST catalog client.
//!
//! Implements the table operations of the Apache Iceberg REST Catalog API on
//! top of `reqwest`. Authentication is an optional bearer token taken from the
//! `token` catalog property.
//!
//! The catalog stores table metadata; manifests and manifest lists are written
//! by this client to the storage prefix before a snapshot is proposed.

use crate::config::{CatalogType, DestinationConfig, PROP_TOKEN, PROP_WAREHOUSE};
use crate::error::{CatalogError, CommitError};
use crate::event::TableIdent;
use crate::iceberg::catalog::{
    CatalogFactory, CatalogOperations, CommitResult, FileCommit, TableInfo,
};
use crate::iceberg::manifest::SnapshotProducer;
use crate::iceberg::metadata::{Snapshot, FORMAT_VERSION, MAIN_BRANCH};
use crate::iceberg::rest_api;
use crate::iceberg::storage::Storage;
use crate::iceberg::type_mapper::DestinationSchema;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Separator of namespace levels in REST paths.
const NAMESPACE_SEPARATOR: &str = "\u{1f}";
const PROP_FORMAT_VERSION: &str = "format-version";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Factory for REST catalog.
pub struct RestCatalogFactory;

#[async_trait]
impl CatalogFactory for RestCatalogFactory {
    async fn create(&self, config: &DestinationConfig) -> Result<Arc<dyn CatalogOperations>> {
        let uri = config
            .catalog_uri
            .as_ref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("REST catalog requires catalog_uri to be set".into()))?;

        let storage = Storage::open(&config.prefix, &config.properties)?;
        let client = RestCatalogClient::new(
            RestClientConfig {
                base_uri: uri.trim_end_matches('/').to_string(),
                timeout: DEFAULT_REQUEST_TIMEOUT,
                bearer_token: config.property(PROP_TOKEN).map(str::to_string),
                warehouse: config.property(PROP_WAREHOUSE).map(str::to_string),
            },
            storage,
        )?;
        Ok(Arc::new(client))
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Rest
    }
}

/// REST catalog client configuration.
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// REST API base URI
    pub base_uri: String,
    /// Request timeout
    pub timeout: Duration,
    /// Bearer token
    pub bearer_token: Option<String>,
    /// Warehouse requested from the catalog
    pub warehouse: Option<String>,
}

/// REST catalog client implementation.
pub struct RestCatalogClient {
    client: Client,
    config: RestClientConfig,
    storage: Storage,
}

impl RestCatalogClient {
    /// Create a new REST catalog client writing manifests to `storage`.
    pub fn new(config: RestClientConfig, storage: Storage) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(uri = %config.base_uri, "REST catalog client initialized");
        Ok(Self {
            client,
            config,
            storage,
        })
    }

    /// Path of the tables collection of a namespace.
    fn tables_path(namespace: &str) -> String {
        format!("/v1/namespaces/{}/tables", encode_namespace(namespace))
    }

    /// Path of one table.
    fn table_path(ident: &TableIdent) -> String {
        format!(
            "{}/{}",
            Self::tables_path(&ident.namespace),
            urlencoding::encode(&ident.name)
        )
    }

    /// Build a request with authentication.
    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_uri, path);
        let mut request = self.client.request(method, &url);

        if let Some(token) = &self.config.bearer_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(warehouse) = &self.config.warehouse {
            request = request.header("X-Iceberg-Warehouse", warehouse);
        }

        request
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| CatalogError::Connection(e.to_string()).into())
    }

    async fn error_from(&self, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        handle_error_response(status, &body)
    }

    async fn load_metadata(&self, ident: &TableIdent) -> Result<rest_api::LoadTableResponse> {
        let request = self.build_request(reqwest::Method::GET, &Self::table_path(ident));
        let response = self.send(request).await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| CatalogError::Response(e.to_string()).into())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        let request_body = rest_api::CreateNamespaceRequest {
            namespace: namespace.split('.').map(|s| s.to_string()).collect(),
            properties: HashMap::new(),
        };

        let request = self.build_request(reqwest::Method::POST, "/v1/namespaces");
        let response = self.send(request.json(&request_body)).await?;

        match response.status() {
            status if status.is_success() => {
                info!(namespace = %namespace, "Created namespace");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(namespace = %namespace, "Namespace already exists");
                Ok(())
            }
            _ => Err(self.error_from(response).await),
        }
    }

    async fn post_create_table(
        &self,
        ident: &TableIdent,
        request_body: &rest_api::CreateTableRequest,
    ) -> Result<rest_api::LoadTableResponse> {
        let request = self.build_request(reqwest::Method::POST, &Self::tables_path(&ident.namespace));
        let response = self.send(request.json(request_body)).await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| CatalogError::Response(e.to_string()).into())
    }
}

/// Encode a dotted namespace for use in a REST path.
fn encode_namespace(namespace: &str) -> String {
    let joined = namespace.split('.').collect::<Vec<_>>().join(NAMESPACE_SEPARATOR);
    urlencoding::encode(&joined).into_owned()
}

/// Create request for a format v2 table.
fn create_request(
    ident: &TableIdent,
    schema: &DestinationSchema,
    properties: &HashMap<String, String>,
) -> rest_api::CreateTableRequest {
    let mut properties = properties.clone();
    properties
        .entry(PROP_FORMAT_VERSION.to_string())
        .or_insert_with(|| FORMAT_VERSION.to_string());

    rest_api::CreateTableRequest {
        name: ident.name.clone(),
        location: None,
        schema: rest_api::Schema::from(schema),
        properties,
    }
}

/// Request adding `snapshot` and moving the main branch to it.
///
/// Guarded by the main branch still pointing at `expected`.
fn commit_request(expected: Option<i64>, snapshot: Snapshot) -> rest_api::CommitTableRequest {
    let snapshot_id = snapshot.snapshot_id;
    rest_api::CommitTableRequest {
        identifier: None,
        requirements: vec![rest_api::TableRequirement::AssertRefSnapshotId {
            ref_name: MAIN_BRANCH.to_string(),
            snapshot_id: expected,
        }],
        updates: vec![
            rest_api::TableUpdate::AddSnapshot { snapshot },
            rest_api::TableUpdate::SetSnapshotRef {
                ref_name: MAIN_BRANCH.to_string(),
                snapshot_id,
                ref_type: "branch".to_string(),
            },
        ],
    }
}

/// Map an error response from the REST API.
fn handle_error_response(status: StatusCode, body: &str) -> Error {
    let Ok(body) = serde_json::from_str::<rest_api::ErrorBody>(body) else {
        return CatalogError::Response(format!("{}: {}", status, body)).into();
    };
    let error = body.into_inner();

    match status {
        StatusCode::NOT_FOUND if error.error_type.contains("NoSuchNamespace") => {
            CatalogError::NamespaceNotFound(error.message).into()
        }
        StatusCode::NOT_FOUND if error.error_type.contains("NoSuchTable") => {
            CatalogError::TableNotFound(error.message).into()
        }
        StatusCode::CONFLICT if error.error_type.contains("AlreadyExists") => {
            CatalogError::TableAlreadyExists(error.message).into()
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CatalogError::Connection(format!("Authentication failed: {}", error.message)).into()
        }
        _ => CatalogError::Response(format!("{}: {}", status, error.message)).into(),
    }
}

#[async_trait]
impl CatalogOperations for RestCatalogClient {
    async fn load_table(&self, ident: &TableIdent) -> Result<TableInfo> {
        let response = self.load_metadata(ident).await.map_err(|e| match e {
            // a missing namespace means a missing table
            Error::Catalog(CatalogError::NamespaceNotFound(_)) => {
                CatalogError::TableNotFound(ident.to_string()).into()
            }
            other => other,
        })?;
        response.metadata.table_info(ident)
    }

    async fn create_table(
        &self,
        ident: &TableIdent,
        schema: &DestinationSchema,
        properties: &HashMap<String, String>,
    ) -> Result<TableInfo> {
        let request_body = create_request(ident, schema, properties);

        let response = match self.post_create_table(ident, &request_body).await {
            Err(Error::Catalog(CatalogError::NamespaceNotFound(_))) => {
                self.create_namespace(&ident.namespace).await?;
                self.post_create_table(ident, &request_body).await?
            }
            other => other?,
        };

        info!(table = %ident, "Created table");
        response.metadata.table_info(ident)
    }

    async fn drop_table(&self, ident: &TableIdent) -> Result<()> {
        let path = format!("{}?purgeRequested=true", Self::table_path(ident));
        let response = self.send(self.build_request(reqwest::Method::DELETE, &path)).await?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        info!(table = %ident, "Dropped table");
        Ok(())
    }

    async fn commit_files(&self, ident: &TableIdent, commit: FileCommit) -> Result<CommitResult> {
        let current = self.load_metadata(ident).await?.metadata;
        if current.format_version < FORMAT_VERSION {
            return Err(CommitError::Rejected {
                table: ident.to_string(),
                message: format!(
                    "format version {} tables are not supported",
                    current.format_version
                ),
            }
            .into());
        }

        let snapshot = SnapshotProducer::new(&self.storage, ident, &current)
            .produce(&commit)
            .await?;
        let new_snapshot_id = snapshot.snapshot_id;
        let request_body = commit_request(commit.expected_snapshot_id, snapshot);

        let request = self.build_request(reqwest::Method::POST, &Self::table_path(ident));
        let response = self.send(request.json(&request_body)).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status == StatusCode::CONFLICT {
                return Err(CommitError::Conflict {
                    table: ident.to_string(),
                    expected: commit.expected_snapshot_id,
                }
                .into());
            }

            return Err(CommitError::Rejected {
                table: ident.to_string(),
                message: handle_error_response(status, &body).to_string(),
            }
            .into());
        }

        let commit_response: rest_api::CommitTableResponse = response
            .json()
            .await
            .map_err(|e| CatalogError::Response(e.to_string()))?;

        let snapshot_id = commit_response
            .metadata
            .snapshot_id()
            .unwrap_or(new_snapshot_id);

        info!(
            table = %ident,
            snapshot_id = snapshot_id,
            files_added = commit.files.len(),
            "Snapshot committed"
        );

        Ok(CommitResult {
            snapshot_id,
            committed_at: chrono::Utc::now(),
            files_added: commit.files.len(),
        })
    }

    fn catalog_type(&self) -> CatalogType {
        CatalogType::Rest
    }
}
