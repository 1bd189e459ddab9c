//! Storage trait and in-memory implementation

use crate::StorageError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Key-addressed store of JSON values and opaque blobs.
///
/// Keys are free-form strings (`profile:<id>`, `rec.gz:<id>`). JSON and blob
/// values share one key space.
#[async_trait]
pub trait Storage: Send + Sync {
    /// JSON value stored under `key`
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Store a JSON value, replacing whatever was there
    async fn set_json(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Blob stored under `key`
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a blob, replacing whatever was there
    async fn set_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Whether anything is stored under `key`
    async fn has(&self, key: &str) -> Result<bool, StorageError>;

    /// Remove `key`; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Load and deserialize a typed value
pub async fn load<T: DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get_json(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and store a typed value
pub async fn save<T: Serialize + Sync>(
    storage: &dyn Storage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    storage.set_json(key, serde_json::to_value(value)?).await
}

#[derive(Debug, Clone)]
enum Entry {
    Json(Value),
    Blob(Vec<u8>),
}

/// In-memory store, used in tests and for ephemeral sessions
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        info!("Creating in-memory storage");
        Self {
            entries: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of set operations performed so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn insert(&self, key: &str, entry: Entry) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(format!("Lock error: {}", e)))?;
        entries.insert(key.to_string(), entry);
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key, "Stored entry");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Entry>, StorageError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(format!("Lock error: {}", e)))?;
        Ok(entries.get(key).cloned())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.get(key)? {
            Some(Entry::Json(value)) => Ok(Some(value)),
            Some(Entry::Blob(_)) => Err(StorageError::SerializationError(format!(
                "{key} holds a blob, not JSON"
            ))),
            None => Ok(None),
        }
    }

    async fn set_json(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.insert(key, Entry::Json(value))
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.get(key)? {
            Some(Entry::Blob(bytes)) => Ok(Some(bytes)),
            Some(Entry::Json(_)) => Err(StorageError::SerializationError(format!(
                "{key} holds JSON, not a blob"
            ))),
            None => Ok(None),
        }
    }

    async fn set_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.insert(key, Entry::Blob(bytes))
    }

    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Backend(format!("Lock error: {}", e)))?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_json_and_blob_roundtrip() {
        let storage = MemoryStorage::new();
        let sample = Sample {
            name: "civic".into(),
            count: 3,
        };
        save(&storage, "profile:a", &sample).await.unwrap();
        storage.set_blob("rec.gz:1", vec![1, 2, 3]).await.unwrap();

        let loaded: Option<Sample> = load(&storage, "profile:a").await.unwrap();
        assert_eq!(loaded, Some(sample));
        assert_eq!(storage.get_blob("rec.gz:1").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.write_count(), 2);
        assert_eq!(storage.keys(), vec!["profile:a".to_string(), "rec.gz:1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_and_remove() {
        let storage = MemoryStorage::new();
        assert!(!storage.has("nope").await.unwrap());
        assert_eq!(storage.get_json("nope").await.unwrap(), None);
        storage.remove("nope").await.unwrap();

        storage.set_json("k", Value::Bool(true)).await.unwrap();
        assert!(storage.has("k").await.unwrap());
        storage.remove("k").await.unwrap();
        assert!(!storage.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_an_error() {
        let storage = MemoryStorage::new();
        storage.set_blob("k", vec![0]).await.unwrap();
        assert!(matches!(
            storage.get_json("k").await,
            Err(StorageError::SerializationError(_))
        ));
    }
}
