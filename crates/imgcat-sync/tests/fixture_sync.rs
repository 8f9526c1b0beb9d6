use std::path::PathBuf;
use std::sync::Arc;

use imgcat_drivers::FixtureDriver;
use imgcat_storage::{MemoryKvStore, SqliteImageIndex};
use imgcat_sync::{Catalog, SyncPipeline};

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/driver")
}

async fn fixture_pipeline() -> SyncPipeline {
    let index = SqliteImageIndex::in_memory().await.unwrap();
    let catalog = Catalog::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(index),
        Arc::new(FixtureDriver::new(fixtures_root())),
    );
    SyncPipeline::new(Arc::new(catalog))
}

#[tokio::test]
async fn fixture_sync_is_idempotent_and_reports_broken_target() {
    let pipeline = fixture_pipeline().await;

    let first = pipeline.sync_all("ns1").await.unwrap();
    assert_eq!(first.target_count, 4);
    assert_eq!(first.image_count, 7);
    assert!(first.is_degraded());

    let failed: Vec<_> = first
        .targets
        .iter()
        .filter(|t| t.error.is_some())
        .map(|t| t.connection_name.as_str())
        .collect();
    assert_eq!(failed, vec!["openstack-regionone"]);

    let second = pipeline.sync_all("ns1").await.unwrap();
    assert_eq!(second.target_count, 4);
    assert_eq!(second.image_count, 0);

    let stored = pipeline.catalog().list_images("ns1").await.unwrap();
    assert_eq!(stored.len(), 7);
    assert!(stored.iter().all(|r| r.is_auto_generated));
}

#[tokio::test]
async fn fixture_images_get_deterministic_ids() {
    let pipeline = fixture_pipeline().await;
    pipeline.sync_all("ns1").await.unwrap();

    for id in [
        "aws-us-east-1-ubuntu-images-hvm-ssd-ubuntu-focal-20-04-amd64-server-20210430",
        "aws-us-east-1-amzn2-ami-hvm-2-0-20210427-0-x86-64-gp2",
        "aws-us-east-1-ami-0f9e8d7c6b5a40312",
        "azure-koreacentral-canonical-ubuntuserver-18-04-lts-latest",
        "azure-koreacentral-openlogic-centos-7-5-latest",
        "gcp-asia-east1-projects-ubuntu-os-cloud-global-images-ubuntu-2004-focal-v20210429",
        "gcp-asia-east1-projects-debian-cloud-global-images-debian-10-buster-v20210420",
    ] {
        assert!(
            pipeline.catalog().image_exists("ns1", id).await.unwrap(),
            "missing {id}"
        );
    }
}

#[tokio::test]
async fn fixture_catalog_is_searchable_by_keyword() {
    let pipeline = fixture_pipeline().await;
    pipeline.sync_all("ns1").await.unwrap();

    let ubuntu = pipeline
        .catalog()
        .search_images("ns1", &["Ubuntu"])
        .await
        .unwrap();
    assert_eq!(ubuntu.len(), 3);

    let focal = pipeline
        .catalog()
        .search_images("ns1", &["ubuntu", "focal"])
        .await
        .unwrap();
    assert_eq!(focal.len(), 2);

    let none = pipeline
        .catalog()
        .search_images("ns2", &["ubuntu"])
        .await
        .unwrap();
    assert!(none.is_empty());

    let summary = serde_json::to_value(pipeline.sync_all("ns1").await.unwrap()).unwrap();
    assert_eq!(summary["image_count"], 0);
    assert_eq!(summary["targets"].as_array().map(Vec::len), Some(4));
}
