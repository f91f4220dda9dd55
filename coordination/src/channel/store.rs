//! Backing stores for the synchronization channel.
//!
//! A store is a dumb durable key/value substrate. It does not poll, retry or
//! interpret empty values; [`SyncChannel`](super::SyncChannel) layers those
//! semantics on top. Every store must make `take` claim a record at most
//! once across concurrent readers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

/// Errors raised by a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Store command failed for '{key}': {message}")]
    CommandFailed { key: String, message: String },

    #[error("Key '{0}' cannot be represented in this store")]
    InvalidKey(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::CommandFailed { .. })
    }
}

/// Durable key/value substrate shared across the driver/worker boundary.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    /// Short description for logs (e.g. the directory path).
    fn describe(&self) -> String;

    /// Durably write `value` under `key`, replacing any previous value.
    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Single non-blocking read. `None` when the key is absent.
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read and remove (or acknowledge) `key` in one step.
    ///
    /// Returns `None` if the key is absent or another reader claimed it
    /// first.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Keys become file names, so only a conservative character set is allowed.
fn check_file_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// One file per key inside a shared directory.
///
/// Writes go through a temp file and an atomic rename so a reader never
/// observes a partial value. `take` claims a record by renaming it to a
/// reader-unique name; only one rename of the same source can succeed.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        check_file_key(key)?;
        Ok(self.root.join(key))
    }

    fn io(key: &str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ExchangeStore for FileStore {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, value.as_bytes())
            .await
            .map_err(|e| Self::io(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io(key, e))?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        // A missing root is an unmounted share, not an absent key.
        if !tokio::fs::try_exists(&self.root)
            .await
            .map_err(|e| Self::io(key, e))?
        {
            return Err(Self::io(
                key,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("exchange directory {} is missing", self.root.display()),
                ),
            ));
        }
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io(key, e)),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        let claimed = self
            .root
            .join(format!(".{}.{}.claimed", key, uuid::Uuid::new_v4().simple()));
        match tokio::fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io(key, e)),
        }
        let value = tokio::fs::read_to_string(&claimed)
            .await
            .map_err(|e| Self::io(key, e))?;
        if let Err(e) = tokio::fs::remove_file(&claimed).await {
            tracing::warn!(key, error = %e, "Failed to remove claimed exchange record");
        }
        Ok(Some(value))
    }
}

/// Process-local store, for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExchangeStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        records.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.get(key).cloned())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_write_read_take() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert_eq!(store.read("action_1").await.unwrap(), None);
        store.write("action_1", "Up").await.unwrap();
        assert_eq!(store.read("action_1").await.unwrap().as_deref(), Some("Up"));

        assert_eq!(store.take("action_1").await.unwrap().as_deref(), Some("Up"));
        assert_eq!(store.take("action_1").await.unwrap(), None);
        assert_eq!(store.read("action_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.write("level", "3").await.unwrap();
        store.write("level", "4").await.unwrap();
        store.take("level").await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_missing_root_is_transient_error() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("not-mounted"));
        let err = store.read("action_0").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        for key in ["../escape", ".hidden", "a/b", ""] {
            let err = store.write(key, "x").await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "{key}");
            assert!(!err.is_transient());
        }
    }

    #[tokio::test]
    async fn test_memory_store_take_is_single_shot() {
        let store = MemoryStore::new();
        store.write("k", "v").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.take("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.take("k").await.unwrap(), None);
        assert!(store.is_empty());
    }
}
