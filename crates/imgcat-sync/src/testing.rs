//! Hand-written trait fakes for failure injection.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use imgcat_core::{CanonicalImageRecord, ConnectionTarget, Iid, KeyValue, ProviderImageRecord};
use imgcat_drivers::{DriverError, DriverTransport, ProviderDriver};
use imgcat_storage::{ImageIndex, IndexError, KvStore, MemoryKvStore, StoreError};

pub fn provider_image(name_id: &str, display_name: Option<&str>) -> ProviderImageRecord {
    let mut key_value_list = vec![KeyValue::new("CreationDate", "2021-04-30T00:00:00Z")];
    if let Some(name) = display_name {
        key_value_list.push(KeyValue::new("Name", name));
    }
    ProviderImageRecord {
        name: String::new(),
        iid: Iid {
            name_id: name_id.to_string(),
            system_id: name_id.to_string(),
        },
        guest_os: "Linux".to_string(),
        status: "available".to_string(),
        key_value_list,
    }
}

pub fn target(name: &str) -> ConnectionTarget {
    ConnectionTarget {
        config_name: name.to_string(),
        provider_name: "AWS".to_string(),
        driver_name: "aws-driver-v1.0".to_string(),
        credential_name: "aws-cred".to_string(),
        region_name: "aws-us-east-1".to_string(),
    }
}

/// Driver serving canned per-connection image lists; a connection mapped to `Err` fails its listing.
#[derive(Default)]
pub struct FakeDriver {
    targets: Vec<ConnectionTarget>,
    images: BTreeMap<String, Result<Vec<ProviderImageRecord>, String>>,
    lookup_override: Option<ProviderImageRecord>,
    fail_target_listing: bool,
    list_calls: AtomicUsize,
    target_list_calls: AtomicUsize,
}

impl FakeDriver {
    pub fn with_images(mut self, connection: &str, images: Vec<ProviderImageRecord>) -> Self {
        self.targets.push(target(connection));
        self.images.insert(connection.to_string(), Ok(images));
        self
    }

    pub fn with_failing_target(mut self, connection: &str, message: &str) -> Self {
        self.targets.push(target(connection));
        self.images
            .insert(connection.to_string(), Err(message.to_string()));
        self
    }

    pub fn with_lookup_override(mut self, record: ProviderImageRecord) -> Self {
        self.lookup_override = Some(record);
        self
    }

    pub fn failing_target_listing(mut self) -> Self {
        self.fail_target_listing = true;
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn target_list_calls(&self) -> usize {
        self.target_list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderDriver for FakeDriver {
    fn transport(&self) -> DriverTransport {
        DriverTransport::Fixture
    }

    async fn list_connection_targets(&self) -> Result<Vec<ConnectionTarget>, DriverError> {
        self.target_list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_target_listing {
            return Err(DriverError::Message("connection config unavailable".into()));
        }
        Ok(self.targets.clone())
    }

    async fn list_images(
        &self,
        connection_name: &str,
    ) -> Result<Vec<ProviderImageRecord>, DriverError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        match self.images.get(connection_name) {
            Some(Ok(images)) => Ok(images.clone()),
            Some(Err(message)) => Err(DriverError::Message(message.clone())),
            None => Err(DriverError::Message(format!(
                "unknown connection {connection_name}"
            ))),
        }
    }

    async fn get_image(
        &self,
        connection_name: &str,
        csp_image_id: &str,
    ) -> Result<ProviderImageRecord, DriverError> {
        if let Some(record) = &self.lookup_override {
            return Ok(record.clone());
        }
        self.list_images(connection_name)
            .await?
            .into_iter()
            .find(|image| image.iid.name_id == csp_image_id)
            .ok_or_else(|| DriverError::Message(format!("image {csp_image_id} not found")))
    }
}

fn unreachable_store() -> StoreError {
    StoreError::Io {
        context: "reading value".into(),
        source: io::Error::new(io::ErrorKind::ConnectionRefused, "store unreachable"),
    }
}

/// Memory store whose reads or writes can be forced to fail.
pub struct FaultyKv {
    inner: MemoryKvStore,
    fail_get: bool,
    fail_put: bool,
    writes: AtomicUsize,
}

impl FaultyKv {
    pub fn failing_reads() -> Self {
        Self {
            inner: MemoryKvStore::new(),
            fail_get: true,
            fail_put: false,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn failing_writes() -> Self {
        Self {
            inner: MemoryKvStore::new(),
            fail_get: false,
            fail_put: true,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write_attempt(&self) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_put {
            return Err(StoreError::Io {
                context: "writing value".into(),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FaultyKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_get {
            return Err(unreachable_store());
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write_attempt()?;
        self.inner.put(key, value).await
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.write_attempt()?;
        self.inner.put_if_absent(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.write_attempt()?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        if self.fail_get {
            return Err(unreachable_store());
        }
        self.inner.list(prefix).await
    }
}

/// Index that rejects every call.
pub struct FailingIndex;

#[async_trait]
impl ImageIndex for FailingIndex {
    async fn insert(&self, _record: &CanonicalImageRecord) -> Result<(), IndexError> {
        Err(IndexError::Database(sqlx::Error::PoolClosed))
    }

    async fn update(
        &self,
        _namespace: &str,
        _id: &str,
        _record: &CanonicalImageRecord,
    ) -> Result<(), IndexError> {
        Err(IndexError::Database(sqlx::Error::PoolClosed))
    }

    async fn delete(&self, _namespace: &str, _id: &str) -> Result<(), IndexError> {
        Err(IndexError::Database(sqlx::Error::PoolClosed))
    }

    async fn search(
        &self,
        _namespace: &str,
        _name_fragments: &[String],
    ) -> Result<Vec<CanonicalImageRecord>, IndexError> {
        Err(IndexError::Database(sqlx::Error::PoolClosed))
    }
}
