//! Persistence backends for the image catalog plus the HTTP client used to reach drivers.
//!
//! The key-value side ([`KvStore`]) is authoritative; the relational side ([`ImageIndex`])
//! exists for search and may lag behind it.

mod http;
mod index;
mod kv;

use imgcat_core::CatalogError;

pub use http::{
    is_transient_error, is_transient_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher,
};
pub use index::{contains_pattern, ImageIndex, IndexError, SqliteImageIndex};
pub use kv::{FsKvStore, KvStore, MemoryKvStore, ResourceRepository, StoreError};

pub const CRATE_NAME: &str = "imgcat-storage";

impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        CatalogError::Persistence(err.to_string())
    }
}

impl From<IndexError> for CatalogError {
    fn from(err: IndexError) -> Self {
        CatalogError::Persistence(err.to_string())
    }
}
