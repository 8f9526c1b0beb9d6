//! Provider driver contracts + the REST gateway and fixture-backed implementations.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use imgcat_core::{CatalogError, ConnectionTarget, ProviderImageRecord};
use imgcat_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "imgcat-drivers";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<DriverError> for CatalogError {
    fn from(err: DriverError) -> Self {
        CatalogError::Provider(err.to_string())
    }
}

/// How the catalog reaches the provider driver. Chosen once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverTransport {
    Rest,
    Fixture,
}

impl FromStr for DriverTransport {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REST" => Ok(Self::Rest),
            "FIXTURE" => Ok(Self::Fixture),
            other => Err(DriverError::InvalidArgument(format!(
                "unknown driver transport {other:?} (expected REST or FIXTURE)"
            ))),
        }
    }
}

#[async_trait]
pub trait ProviderDriver: Send + Sync {
    fn transport(&self) -> DriverTransport;

    async fn list_connection_targets(&self) -> Result<Vec<ConnectionTarget>, DriverError>;

    async fn list_images(
        &self,
        connection_name: &str,
    ) -> Result<Vec<ProviderImageRecord>, DriverError>;

    async fn get_image(
        &self,
        connection_name: &str,
        csp_image_id: &str,
    ) -> Result<ProviderImageRecord, DriverError>;
}

/// `GET /vmimage` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderImageList {
    #[serde(default)]
    pub image: Vec<ProviderImageRecord>,
}

/// `GET /connectionconfig` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderConnectionConfigList {
    #[serde(rename = "connectionconfig", default)]
    pub connection_config: Vec<ConnectionTarget>,
}

fn require(value: &str, what: &str) -> Result<(), DriverError> {
    if value.is_empty() {
        return Err(DriverError::InvalidArgument(format!(
            "{what} must not be empty"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SpiderRestDriver {
    base_url: String,
    http: HttpFetcher,
}

impl SpiderRestDriver {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn connection_config_url(&self) -> String {
        format!("{}/connectionconfig", self.base_url)
    }

    pub fn image_list_url(&self) -> String {
        format!("{}/vmimage", self.base_url)
    }

    pub fn image_url(&self, csp_image_id: &str) -> String {
        format!(
            "{}/vmimage/{}",
            self.base_url,
            urlencoding::encode(csp_image_id)
        )
    }

    fn connection_body(connection_name: &str) -> serde_json::Value {
        serde_json::json!({ "ConnectionName": connection_name })
    }
}

#[async_trait]
impl ProviderDriver for SpiderRestDriver {
    fn transport(&self) -> DriverTransport {
        DriverTransport::Rest
    }

    async fn list_connection_targets(&self) -> Result<Vec<ConnectionTarget>, DriverError> {
        let list: SpiderConnectionConfigList = self
            .http
            .get_json(&self.connection_config_url(), None)
            .await?;
        Ok(list.connection_config)
    }

    async fn list_images(
        &self,
        connection_name: &str,
    ) -> Result<Vec<ProviderImageRecord>, DriverError> {
        require(connection_name, "connection name")?;
        let body = Self::connection_body(connection_name);
        let list: SpiderImageList = self
            .http
            .get_json(&self.image_list_url(), Some(&body))
            .await?;
        debug!(connection_name, images = list.image.len(), "listed provider images");
        Ok(list.image)
    }

    async fn get_image(
        &self,
        connection_name: &str,
        csp_image_id: &str,
    ) -> Result<ProviderImageRecord, DriverError> {
        require(connection_name, "connection name")?;
        require(csp_image_id, "csp image id")?;
        let body = Self::connection_body(connection_name);
        Ok(self
            .http
            .get_json(&self.image_url(csp_image_id), Some(&body))
            .await?)
    }
}

/// Serves recorded driver replies from disk:
/// `connectionconfig.json` at the root and `<connection>/vmimage.json` per connection.
#[derive(Debug, Clone)]
pub struct FixtureDriver {
    root: PathBuf,
}

impl FixtureDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn connection_dir(&self, connection_name: &str) -> Result<PathBuf, DriverError> {
        require(connection_name, "connection name")?;
        if connection_name.contains(['/', '\\']) || connection_name.starts_with('.') {
            return Err(DriverError::InvalidArgument(format!(
                "connection name {connection_name:?} is not a valid fixture directory"
            )));
        }
        Ok(self.root.join(connection_name))
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl ProviderDriver for FixtureDriver {
    fn transport(&self) -> DriverTransport {
        DriverTransport::Fixture
    }

    async fn list_connection_targets(&self) -> Result<Vec<ConnectionTarget>, DriverError> {
        let list: SpiderConnectionConfigList =
            read_json_file(self.root.join("connectionconfig.json"))?;
        Ok(list.connection_config)
    }

    async fn list_images(
        &self,
        connection_name: &str,
    ) -> Result<Vec<ProviderImageRecord>, DriverError> {
        let path = self.connection_dir(connection_name)?.join("vmimage.json");
        let list: SpiderImageList = read_json_file(&path)?;
        Ok(list.image)
    }

    async fn get_image(
        &self,
        connection_name: &str,
        csp_image_id: &str,
    ) -> Result<ProviderImageRecord, DriverError> {
        require(csp_image_id, "csp image id")?;
        self.list_images(connection_name)
            .await?
            .into_iter()
            .find(|image| image.iid.name_id == csp_image_id)
            .ok_or_else(|| {
                DriverError::Message(format!(
                    "image {csp_image_id} not found for connection {connection_name}"
                ))
            })
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub transport: DriverTransport,
    pub spider_rest_url: String,
    pub fixtures_dir: PathBuf,
    pub http: HttpClientConfig,
}

pub fn driver_for_config(config: &DriverConfig) -> Result<Arc<dyn ProviderDriver>, DriverError> {
    match config.transport {
        DriverTransport::Rest => {
            let http = HttpFetcher::new(config.http.clone())?;
            Ok(Arc::new(SpiderRestDriver::new(
                config.spider_rest_url.clone(),
                http,
            )))
        }
        DriverTransport::Fixture => Ok(Arc::new(FixtureDriver::new(config.fixtures_dir.clone()))),
    }
}
