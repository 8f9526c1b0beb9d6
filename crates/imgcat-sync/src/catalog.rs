//! Dual-store image registry: key-value store first, relational index second.

use std::sync::Arc;

use imgcat_core::{
    check_immutable_fields, check_name, convert_provider_image, merge_image, normalize_image_name,
    CanonicalImageRecord, CatalogError, CatalogResult, RegistrationRequest, KIND_IMAGE,
};
use imgcat_drivers::ProviderDriver;
use imgcat_storage::{ImageIndex, KvStore, ResourceRepository};
use tracing::{info, warn};

pub struct Catalog {
    images: ResourceRepository<CanonicalImageRecord>,
    index: Arc<dyn ImageIndex>,
    driver: Arc<dyn ProviderDriver>,
}

impl Catalog {
    pub fn new(
        kv: Arc<dyn KvStore>,
        index: Arc<dyn ImageIndex>,
        driver: Arc<dyn ProviderDriver>,
    ) -> Self {
        Self {
            images: ResourceRepository::new(kv),
            index,
            driver,
        }
    }

    pub fn driver(&self) -> &Arc<dyn ProviderDriver> {
        &self.driver
    }

    /// Registers an image by looking it up live through the provider driver.
    pub async fn register_with_request(
        &self,
        namespace: &str,
        request: &RegistrationRequest,
    ) -> CatalogResult<CanonicalImageRecord> {
        check_name(namespace)?;
        request.validate()?;
        self.ensure_absent(namespace, &request.name).await?;

        let provider = self
            .driver
            .get_image(&request.connection_name, &request.csp_image_id)
            .await
            .map_err(|err| {
                warn!(connection = %request.connection_name, error = %err, "provider image lookup failed");
                CatalogError::from(err)
            })?;

        let mut record = convert_provider_image(provider)?;
        record.namespace = namespace.to_string();
        record.connection_name = request.connection_name.clone();
        record.id = request.name.clone();
        record.name = request.name.clone();
        if !request.description.is_empty() {
            record.description = request.description.clone();
        }
        record.associated_object_list = Vec::new();

        self.persist_new(record).await
    }

    /// Registers an already populated record without a provider round-trip; the id is the name.
    pub async fn register_with_record(
        &self,
        namespace: &str,
        mut record: CanonicalImageRecord,
    ) -> CatalogResult<CanonicalImageRecord> {
        check_name(namespace)?;
        check_name(&record.name)?;
        self.ensure_absent(namespace, &record.name).await?;

        record.namespace = namespace.to_string();
        record.id = record.name.clone();
        record.associated_object_list = Vec::new();

        self.persist_new(record).await
    }

    pub async fn update_image(
        &self,
        namespace: &str,
        id: &str,
        partial: CanonicalImageRecord,
    ) -> CatalogResult<CanonicalImageRecord> {
        check_name(namespace)?;
        check_immutable_fields(&partial)?;

        if !self.image_exists(namespace, id).await? {
            return Err(not_found(id));
        }
        let existing = self
            .images
            .get(namespace, id)
            .await?
            .ok_or_else(|| not_found(id))?;
        let merged = merge_image(&existing, partial)?;

        self.images.put(namespace, &merged).await?;
        if let Err(err) = self.index.update(namespace, id, &merged).await {
            warn!(namespace, id, error = %err, "relational index update failed; key-value record is authoritative");
        }
        Ok(merged)
    }

    pub async fn get_image(&self, namespace: &str, id: &str) -> CatalogResult<CanonicalImageRecord> {
        check_name(namespace)?;
        self.images
            .get(namespace, id)
            .await?
            .ok_or_else(|| not_found(id))
    }

    /// Existence check keyed by (namespace, kind, id). Store failures map to `ExistenceCheckFailed`.
    pub async fn image_exists(&self, namespace: &str, id: &str) -> CatalogResult<bool> {
        self.images
            .exists(namespace, id)
            .await
            .map_err(|err| CatalogError::ExistenceCheckFailed {
                kind: KIND_IMAGE,
                id: id.to_string(),
                reason: err.to_string(),
            })
    }

    pub async fn list_images(&self, namespace: &str) -> CatalogResult<Vec<CanonicalImageRecord>> {
        check_name(namespace)?;
        Ok(self.images.list(namespace).await?)
    }

    /// Removes an image that nothing references any more.
    pub async fn delete_image(&self, namespace: &str, id: &str) -> CatalogResult<()> {
        let record = self.get_image(namespace, id).await?;
        if !record.associated_object_list.is_empty() {
            return Err(CatalogError::Validation(format!(
                "the image {id} is still in use by {}",
                record.associated_object_list.join(", ")
            )));
        }

        if !self.images.delete(namespace, id).await? {
            return Err(not_found(id));
        }
        if let Err(err) = self.index.delete(namespace, id).await {
            warn!(namespace, id, error = %err, "relational index delete failed");
        }
        Ok(())
    }

    /// Images in `namespace` whose name contains every normalized keyword.
    pub async fn search_images<S: AsRef<str>>(
        &self,
        namespace: &str,
        keywords: &[S],
    ) -> CatalogResult<Vec<CanonicalImageRecord>> {
        check_name(namespace)?;
        let fragments: Vec<String> = keywords
            .iter()
            .map(|k| normalize_image_name(k.as_ref()))
            .collect();
        Ok(self.index.search(namespace, &fragments).await?)
    }

    async fn ensure_absent(&self, namespace: &str, id: &str) -> CatalogResult<()> {
        if self.image_exists(namespace, id).await? {
            return Err(already_exists(id));
        }
        Ok(())
    }

    async fn persist_new(&self, record: CanonicalImageRecord) -> CatalogResult<CanonicalImageRecord> {
        // Conditional write: a concurrent registration that won the race keeps its record.
        if !self.images.put_if_absent(&record.namespace, &record).await? {
            return Err(already_exists(&record.id));
        }
        if let Err(err) = self.index.insert(&record).await {
            warn!(
                namespace = %record.namespace,
                id = %record.id,
                error = %err,
                "relational index insert failed; key-value record kept"
            );
        }
        info!(namespace = %record.namespace, id = %record.id, "registered image");
        Ok(record)
    }
}

fn already_exists(id: &str) -> CatalogError {
    CatalogError::AlreadyExists {
        kind: KIND_IMAGE,
        id: id.to_string(),
    }
}

fn not_found(id: &str) -> CatalogError {
    CatalogError::NotFound {
        kind: KIND_IMAGE,
        id: id.to_string(),
    }
}
