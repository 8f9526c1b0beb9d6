//! Authoritative key-value storage for catalog resources.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use imgcat_core::{resource_key, resource_prefix, Resource};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed value under {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Writes only when `key` is vacant. Returns `false` without touching the store otherwise.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// One JSON file per key under `root`; `/ns/a/resources/image/x` lives at `root/ns/a/resources/image/x.json`.
#[derive(Debug, Clone)]
pub struct FsKvStore {
    root: PathBuf,
}

impl FsKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn segments(key: &str) -> Result<Vec<&str>, StoreError> {
        let segments: Vec<&str> = key.trim_start_matches('/').split('/').collect();
        let valid = segments
            .iter()
            .all(|s| !s.is_empty() && *s != "." && *s != ".." && !s.contains('\\'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(segments)
    }

    pub fn path_for_key(&self, key: &str) -> Result<PathBuf, StoreError> {
        let segments = Self::segments(key)?;
        let (file, dirs) = segments
            .split_last()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let mut path = self.root.clone();
        path.extend(dirs);
        Ok(path.join(format!("{file}.json")))
    }

    /// Writes `value` to a fresh temp file next to `path` and returns the temp path.
    async fn write_temp(&self, path: &Path, value: &str) -> Result<PathBuf, StoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(format!("creating directory {}", parent.display()), e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), value.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(format!("opening temp file {}", temp_path.display()), e))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|e| StoreError::io(format!("writing temp file {}", temp_path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(format!("flushing temp file {}", temp_path.display()), e))?;
        Ok(temp_path)
    }
}

#[async_trait]
impl KvStore for FsKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for_key(key)?;
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(format!("reading {}", path.display()), err)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for_key(key)?;
        let temp_path = self.write_temp(&path, value).await?;
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(
                format!("renaming {} -> {}", temp_path.display(), path.display()),
                err,
            ));
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let path = self.path_for_key(key)?;
        let temp_path = self.write_temp(&path, value).await?;
        // hard_link refuses an existing destination, which makes the claim atomic.
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(StoreError::io(
                format!("linking {} -> {}", temp_path.display(), path.display()),
                err,
            )),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for_key(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io(format!("removing {}", path.display()), err)),
        }
    }

    /// Only scans the directory the prefix points into; keys in nested directories are not listed.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let dir_key = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let mut dir = self.root.clone();
        if !dir_key.trim_start_matches('/').is_empty() {
            dir.extend(Self::segments(dir_key)?);
        }

        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(format!("listing {}", dir.display()), err)),
        };

        let mut out = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            let Some(stem) = file_name.strip_suffix(".json") else {
                continue;
            };
            let key = format!("{dir_key}/{stem}");
            if !key.starts_with(prefix) {
                continue;
            }
            let value = fs::read_to_string(entry.path())
                .await
                .map_err(|e| StoreError::io(format!("reading {}", entry.path().display()), e))?;
            out.push((key, value));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// Typed access to one resource kind inside the key-value store.
pub struct ResourceRepository<T> {
    kv: Arc<dyn KvStore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceRepository<T> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            _kind: PhantomData,
        }
    }
}

impl<T: Resource> ResourceRepository<T> {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            _kind: PhantomData,
        }
    }

    pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StoreError> {
        let key = resource_key(namespace, T::KIND, id);
        Ok(self.kv.get(&key).await?.is_some())
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<Option<T>, StoreError> {
        let key = resource_key(namespace, T::KIND, id);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Decode { key, source }),
            None => Ok(None),
        }
    }

    pub async fn put(&self, namespace: &str, record: &T) -> Result<(), StoreError> {
        let (key, value) = Self::encode(namespace, record)?;
        self.kv.put(&key, &value).await?;
        debug!(%key, "stored resource");
        Ok(())
    }

    pub async fn put_if_absent(&self, namespace: &str, record: &T) -> Result<bool, StoreError> {
        let (key, value) = Self::encode(namespace, record)?;
        let written = self.kv.put_if_absent(&key, &value).await?;
        debug!(%key, written, "conditional resource store");
        Ok(written)
    }

    pub async fn delete(&self, namespace: &str, id: &str) -> Result<bool, StoreError> {
        self.kv.delete(&resource_key(namespace, T::KIND, id)).await
    }

    pub async fn list(&self, namespace: &str) -> Result<Vec<T>, StoreError> {
        self.kv
            .list(&resource_prefix(namespace, T::KIND))
            .await?
            .into_iter()
            .map(|(key, raw)| serde_json::from_str(&raw).map_err(|source| StoreError::Decode { key, source }))
            .collect()
    }

    fn encode(namespace: &str, record: &T) -> Result<(String, String), StoreError> {
        let key = resource_key(namespace, T::KIND, record.id());
        let value = serde_json::to_string(record).map_err(|source| StoreError::Encode {
            key: key.clone(),
            source,
        })?;
        Ok((key, value))
    }
}
