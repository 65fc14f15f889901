//! Namespaced key/value persistence for extensions.
//!
//! One namespace per extension identifier. The gateway validates
//! addressing and serializes writes per (namespace, key); the backend only
//! has to make a single write atomic with respect to readers.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::manifest::validate_identifier;

/// Longest accepted key, in bytes. Keeps encoded file names under 255.
pub const MAX_KEY_LEN: usize = 128;

const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
    #[error("corrupt record in namespace '{namespace}': {reason}")]
    Corrupt { namespace: String, reason: String },
}

/// Durable key/value backing store. Namespaces and keys arrive validated.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the value. Readers observe either the old or the new value.
    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Returns whether a value existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    async fn list_keys(&self, namespace: &str) -> Result<BTreeSet<String>, StorageError>;

    async fn delete_namespace(&self, namespace: &str) -> Result<(), StorageError>;
}

// ─── Local Filesystem Backend ──────────────────────────────────────

/// One directory per namespace, one file per key.
///
/// File names are the URL-safe base64 of the key, so any key maps to a
/// portable name. Writes land in a temp file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base_path
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.base_path.join(namespace)
    }

    fn record_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.record_path(namespace, key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        fs::write(&tmp, value).await?;
        if let Err(e) = fs::rename(&tmp, self.record_path(namespace, key)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.record_path(namespace, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self, namespace: &str) -> Result<BTreeSet<String>, StorageError> {
        let mut keys = BTreeSet::new();
        let mut entries = match fs::read_dir(self.namespace_dir(namespace)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let key = URL_SAFE_NO_PAD
                .decode(name)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(|| StorageError::Corrupt {
                    namespace: namespace.to_string(),
                    reason: format!("undecodable record name '{name}'"),
                })?;
            keys.insert(key);
        }
        Ok(keys)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.namespace_dir(namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── In-memory Backend ─────────────────────────────────────────────

/// Volatile backend for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .records
            .write()
            .await
            .get_mut(namespace)
            .and_then(|ns| ns.remove(key))
            .is_some())
    }

    async fn list_keys(&self, namespace: &str) -> Result<BTreeSet<String>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        self.records.write().await.remove(namespace);
        Ok(())
    }
}

// ─── Gateway ───────────────────────────────────────────────────────

type KeyLocks = StdMutex<HashMap<(String, String), Arc<Mutex<()>>>>;

/// Validating front for a [`StorageBackend`].
pub struct StorageGateway {
    backend: Arc<dyn StorageBackend>,
    write_locks: KeyLocks,
}

impl StorageGateway {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn file(base_path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileStore::new(base_path)))
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_address(namespace, key)?;
        self.backend.get(namespace, key).await
    }

    pub async fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_address(namespace, key)?;
        let lock = self.key_lock(namespace, key);
        let result = {
            let _guard = lock.lock().await;
            self.backend.set(namespace, key, value).await
        };
        self.release_key_lock(namespace, key, lock);
        tracing::trace!(namespace = %namespace, key = %key, bytes = value.len(), "storage set");
        result
    }

    /// Returns whether a value existed.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        check_address(namespace, key)?;
        let lock = self.key_lock(namespace, key);
        let result = {
            let _guard = lock.lock().await;
            self.backend.delete(namespace, key).await
        };
        self.release_key_lock(namespace, key, lock);
        result
    }

    pub async fn list_keys(&self, namespace: &str) -> Result<BTreeSet<String>, StorageError> {
        check_namespace(namespace)?;
        self.backend.list_keys(namespace).await
    }

    /// Remove every record under `namespace`.
    pub async fn delete_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        check_namespace(namespace)?;
        self.backend.delete_namespace(namespace).await?;
        tracing::info!(namespace = %namespace, "storage namespace deleted");
        Ok(())
    }

    fn key_lock(&self, namespace: &str, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            locks
                .entry((namespace.to_string(), key.to_string()))
                .or_default(),
        )
    }

    fn release_key_lock(&self, namespace: &str, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        let map_key = (namespace.to_string(), key.to_string());
        if locks
            .get(&map_key)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            locks.remove(&map_key);
        }
    }
}

fn check_namespace(namespace: &str) -> Result<(), StorageError> {
    validate_identifier(namespace)
        .map_err(|_| StorageError::InvalidNamespace(namespace.to_string()))
}

fn check_address(namespace: &str, key: &str) -> Result<(), StorageError> {
    check_namespace(namespace)?;
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(StorageError::InvalidKey(
            "key must not contain control characters".into(),
        ));
    }
    Ok(())
}
