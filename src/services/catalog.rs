//! Client for the external GIS catalog's REST API (GeoServer dialect).
//!
//! Publishing a layer takes several remote mutations. Each one that creates
//! catalog state records an inverse action. If a later step fails, the
//! recorded actions run in reverse so no half-configured store is left
//! behind.

use reqwest::{
    Client, RequestBuilder, Response, StatusCode,
    header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE},
};
use serde::Serialize;
use serde_json::json;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::shapefile;
use crate::{
    errors::{MapError, MapResult},
    models::map_record::FileType,
};

/// Network upload increment (1 MiB).
const STREAM_CHUNK_BYTES: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RASTER_STYLE: &str = "raster";
const DECLARED_SRS: &str = "EPSG:4326";

/// Connection settings for the catalog, injected at construction.
#[derive(Clone)]
pub struct CatalogConfig {
    /// Base URL without trailing slash, e.g. `http://geoserver:8080/geoserver`.
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub workspace: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("workspace", &self.workspace)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Transport failure, timeout or 5xx. The same request may succeed later.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    /// The catalog answered and refused.
    #[error("catalog rejected {operation} (HTTP {status}): {body}")]
    Rejected {
        operation: String,
        status: u16,
        body: String,
    },
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PublishedLayer {
    pub workspace: String,
    pub layer_name: String,
}

/// Inverse of a catalog mutation.
#[derive(Debug, Clone, PartialEq)]
enum Compensation {
    DeleteCoverageStore(String),
    DeleteDataStore(String),
}

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    config: Arc<CatalogConfig>,
}

/// Catalog layer name for a file: its stem, lower-cased, spaces replaced.
pub fn normalize_layer_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_lowercase()
        .replace(' ', "_")
}

impl CatalogClient {
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(config.timeout))
            .user_agent(concat!("lunar-maps/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| CatalogError::Unavailable(format!("building HTTP client: {err}")))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/{}", self.config.base_url, path)
    }

    fn store_url(&self, file_type: FileType, layer: &str) -> String {
        let kind = match file_type {
            FileType::Geotiff => "coveragestores",
            FileType::Shapefile => "datastores",
        };
        self.url(&format!("workspaces/{}/{}/{}", self.config.workspace, kind, layer))
    }

    /// Send with credentials; only transport failures are errors here.
    async fn execute(&self, request: RequestBuilder, operation: &str) -> Result<Response, CatalogError> {
        request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|err| {
                let reason = if err.is_timeout() { "timed out" } else { "request failed" };
                CatalogError::Unavailable(format!("{operation} {reason}: {err}"))
            })
    }

    /// Send and require a 2xx answer.
    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response, CatalogError> {
        let response = self.execute(request, operation).await?;
        check(response, operation).await
    }

    /// Create the workspace if the catalog does not know it yet.
    pub async fn ensure_workspace(&self) -> Result<(), CatalogError> {
        let workspace = &self.config.workspace;
        let operation = "workspace lookup";
        let response = self
            .execute(
                self.http
                    .get(self.url(&format!("workspaces/{}", workspace)))
                    .header(ACCEPT, "application/json"),
                operation,
            )
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            check(response, operation).await?;
            return Ok(());
        }

        info!(workspace = %workspace, "creating catalog workspace");
        self.send(
            self.http
                .post(self.url("workspaces"))
                .json(&json!({ "workspace": { "name": workspace } })),
            "workspace creation",
        )
        .await?;
        Ok(())
    }

    /// Register `path` with the catalog and return the layer it became.
    pub async fn publish(&self, path: &Path, file_type: FileType) -> MapResult<PublishedLayer> {
        let layer_name = normalize_layer_name(path);
        if layer_name.is_empty() {
            return Err(MapError::Validation(format!(
                "cannot derive a layer name from {}",
                path.display()
            )));
        }

        self.ensure_workspace().await?;

        let mut undo = Vec::new();
        let result = match file_type {
            FileType::Geotiff => self.publish_geotiff(path, &layer_name, &mut undo).await,
            FileType::Shapefile => self.publish_shapefile(path, &layer_name, &mut undo).await,
        };

        if let Err(err) = result {
            warn!(layer_name = %layer_name, "publish failed, rolling back {} catalog change(s): {}", undo.len(), err);
            self.compensate(undo).await;
            return Err(err);
        }

        info!(layer_name = %layer_name, workspace = %self.config.workspace, %file_type, "published layer");
        Ok(PublishedLayer {
            workspace: self.config.workspace.clone(),
            layer_name,
        })
    }

    async fn publish_geotiff(
        &self,
        path: &Path,
        layer: &str,
        undo: &mut Vec<Compensation>,
    ) -> MapResult<()> {
        let ws = &self.config.workspace;
        let (body, len) = file_body(path).await?;

        undo.push(Compensation::DeleteCoverageStore(layer.to_string()));
        self.send(
            self.http
                .put(format!(
                    "{}/file.geotiff?configure=first&coverageName={}",
                    self.store_url(FileType::Geotiff, layer),
                    layer
                ))
                .header(CONTENT_TYPE, "image/geotiff")
                .header(CONTENT_LENGTH, len)
                .body(body),
            "coverage store upload",
        )
        .await?;

        self.send(
            self.http.put(self.url(&format!("layers/{}:{}", ws, layer))).json(&json!({
                "layer": {
                    "defaultStyle": { "name": DEFAULT_RASTER_STYLE },
                    "enabled": true
                }
            })),
            "layer configuration",
        )
        .await?;

        self.send(
            self.http
                .put(format!(
                    "{}/coverages/{}",
                    self.store_url(FileType::Geotiff, layer),
                    layer
                ))
                .json(&json!({
                    "coverage": {
                        "srs": DECLARED_SRS,
                        "projectionPolicy": "FORCE_DECLARED",
                        "enabled": true
                    }
                })),
            "coverage projection",
        )
        .await?;
        Ok(())
    }

    async fn publish_shapefile(
        &self,
        path: &Path,
        layer: &str,
        undo: &mut Vec<Compensation>,
    ) -> MapResult<()> {
        let zip_path = path.with_extension("zip");
        let result = self.upload_shapefile_bundle(path, layer, &zip_path, undo).await;

        match fs::remove_file(&zip_path).await {
            Ok(()) => debug!("removed temporary bundle {}", zip_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove temporary bundle {}: {}", zip_path.display(), err),
        }
        result
    }

    async fn upload_shapefile_bundle(
        &self,
        path: &Path,
        layer: &str,
        zip_path: &Path,
        undo: &mut Vec<Compensation>,
    ) -> MapResult<()> {
        let shp = path.to_path_buf();
        let stem = layer.to_string();
        let target: PathBuf = zip_path.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || -> MapResult<usize> {
            let file = std::fs::File::create(&target)?;
            let (_, entries) = shapefile::bundle(&shp, &stem, file)?;
            Ok(entries)
        })
        .await??;
        if entries == 0 {
            return Err(MapError::NotFound(format!(
                "no shapefile members found beside {}",
                path.display()
            )));
        }

        let (body, len) = file_body(zip_path).await?;
        undo.push(Compensation::DeleteDataStore(layer.to_string()));
        self.send(
            self.http
                .put(format!(
                    "{}/file.shp?configure=first",
                    self.store_url(FileType::Shapefile, layer)
                ))
                .header(CONTENT_TYPE, "application/zip")
                .header(CONTENT_LENGTH, len)
                .body(body),
            "data store upload",
        )
        .await?;
        Ok(())
    }

    async fn compensate(&self, undo: Vec<Compensation>) {
        for action in undo.into_iter().rev() {
            let result = match &action {
                Compensation::DeleteCoverageStore(layer) => {
                    self.delete_store(FileType::Geotiff, layer).await
                }
                Compensation::DeleteDataStore(layer) => {
                    self.delete_store(FileType::Shapefile, layer).await
                }
            };
            match result {
                Ok(()) => debug!(?action, "compensation applied"),
                Err(err) => warn!(?action, "compensation failed: {}", err),
            }
        }
    }

    /// Recursively delete a store. A store that does not exist counts as deleted.
    async fn delete_store(&self, file_type: FileType, layer: &str) -> Result<(), CatalogError> {
        let operation = "store deletion";
        let response = self
            .execute(
                self.http
                    .delete(format!("{}?recurse=true", self.store_url(file_type, layer))),
                operation,
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, operation).await?;
        Ok(())
    }

    /// Remove a published layer and its backing store.
    pub async fn unpublish(&self, layer_name: &str, file_type: FileType) -> Result<(), CatalogError> {
        self.delete_store(file_type, layer_name).await?;
        info!(layer_name, %file_type, "unpublished layer");
        Ok(())
    }
}

async fn check(response: Response, operation: &str) -> Result<Response, CatalogError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(CatalogError::Unavailable(format!(
            "{operation} returned HTTP {}: {}",
            status.as_u16(),
            body
        )))
    } else {
        Err(CatalogError::Rejected {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

async fn file_body(path: &Path) -> MapResult<(reqwest::Body, u64)> {
    let file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_BYTES);
    Ok((reqwest::Body::wrap_stream(stream), len))
}
