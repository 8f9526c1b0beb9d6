//! Catalog orchestration: the dual-store registry plus the bulk synchronization pipeline.

mod catalog;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use imgcat_core::{check_name, convert_provider_image, sync_image_id, CatalogError, CatalogResult};
use imgcat_drivers::{driver_for_config, DriverConfig, DriverTransport};
use imgcat_storage::{FsKvStore, HttpClientConfig, SqliteImageIndex};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use catalog::Catalog;

pub const CRATE_NAME: &str = "imgcat-sync";

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub db_path: PathBuf,
    pub store_dir: PathBuf,
    pub driver: DriverConfig,
}

impl CatalogConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let transport = match lookup("SPIDER_CALL_METHOD") {
            Some(raw) => raw
                .parse::<DriverTransport>()
                .context("reading SPIDER_CALL_METHOD")?,
            None => DriverTransport::Rest,
        };
        let http_timeout_secs = match lookup("CATALOG_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("CATALOG_HTTP_TIMEOUT_SECS is not a number: {raw:?}"))?,
            None => 20,
        };

        Ok(Self {
            db_path: lookup("CATALOG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./meta_db/dat/catalog.s3db")),
            store_dir: lookup("CATALOG_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./meta_db/kv")),
            driver: DriverConfig {
                transport,
                spider_rest_url: lookup("SPIDER_REST_URL")
                    .unwrap_or_else(|| "http://localhost:1024/spider".to_string()),
                fixtures_dir: lookup("CATALOG_FIXTURES_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./fixtures/driver")),
                http: HttpClientConfig {
                    timeout: Duration::from_secs(http_timeout_secs),
                    user_agent: Some(
                        lookup("CATALOG_USER_AGENT").unwrap_or_else(|| "imgcat/0.1".to_string()),
                    ),
                    ..Default::default()
                },
            },
        })
    }
}

/// Wires the filesystem key-value store, the SQLite index and the configured driver.
pub async fn open_catalog(config: &CatalogConfig) -> Result<Catalog> {
    let kv = Arc::new(FsKvStore::new(config.store_dir.clone()));
    let index = SqliteImageIndex::open(&config.db_path)
        .await
        .with_context(|| format!("opening image index at {}", config.db_path.display()))?;
    let driver = driver_for_config(&config.driver).context("building provider driver")?;
    info!(
        transport = ?driver.transport(),
        store_dir = %config.store_dir.display(),
        db_path = %config.db_path.display(),
        "catalog opened"
    );
    Ok(Catalog::new(kv, Arc::new(index), driver))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSyncReport {
    pub connection_name: String,
    pub image_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncAllSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_count: usize,
    pub image_count: usize,
    pub targets: Vec<TargetSyncReport>,
}

impl SyncAllSummary {
    /// True when at least one target failed and contributed nothing.
    pub fn is_degraded(&self) -> bool {
        self.targets.iter().any(|t| t.error.is_some())
    }
}

#[derive(Clone)]
pub struct SyncPipeline {
    catalog: Arc<Catalog>,
}

impl SyncPipeline {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Mirrors one connection target into `namespace`, returning how many images were newly registered.
    ///
    /// Images already present are skipped, so reruns register nothing new. A listing, conversion
    /// or registration failure aborts the target.
    pub async fn sync_target(&self, connection_name: &str, namespace: &str) -> CatalogResult<usize> {
        let span = info_span!("sync_target", connection = connection_name, namespace);
        async move {
            check_name(namespace)?;
            let provider_images = self
                .catalog
                .driver()
                .list_images(connection_name)
                .await
                .map_err(CatalogError::from)?;

            let mut count = 0usize;
            for provider in provider_images {
                let mut record = convert_provider_image(provider)?;
                let id = sync_image_id(connection_name, &record.name);

                match self.catalog.image_exists(namespace, &id).await {
                    Ok(true) => {
                        info!(id = %id, "image already registered; skipping");
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(id = %id, error = %err, "existence check failed; skipping image");
                        continue;
                    }
                }

                record.name = id.clone();
                record.connection_name = connection_name.to_string();
                record.is_auto_generated = true;
                match self.catalog.register_with_record(namespace, record).await {
                    Ok(_) => count += 1,
                    Err(CatalogError::AlreadyExists { .. }) => {
                        info!(id = %id, "image registered concurrently; skipping");
                    }
                    Err(err) => return Err(err),
                }
            }

            info!(count, "target sync finished");
            Ok(count)
        }
        .instrument(span)
        .await
    }

    /// Syncs every connection target in order. Per-target failures are recorded, not returned.
    pub async fn sync_all(&self, namespace: &str) -> CatalogResult<SyncAllSummary> {
        check_name(namespace)?;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let targets = self
            .catalog
            .driver()
            .list_connection_targets()
            .await
            .map_err(CatalogError::from)?;

        let mut reports = Vec::with_capacity(targets.len());
        let mut image_count = 0usize;
        for target in &targets {
            let report = match self.sync_target(&target.config_name, namespace).await {
                Ok(count) => {
                    image_count += count;
                    TargetSyncReport {
                        connection_name: target.config_name.clone(),
                        image_count: count,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(connection = %target.config_name, error = %err, "target sync failed");
                    TargetSyncReport {
                        connection_name: target.config_name.clone(),
                        image_count: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        let summary = SyncAllSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            target_count: targets.len(),
            image_count,
            targets: reports,
        };
        info!(
            run_id = %summary.run_id,
            target_count = summary.target_count,
            image_count = summary.image_count,
            degraded = summary.is_degraded(),
            "sync run finished"
        );
        Ok(summary)
    }
}
