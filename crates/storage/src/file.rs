//! Directory-backed storage
//!
//! Each key maps to one file under the root directory. JSON values are kept
//! as `<key>.json`, blobs as `<key>.bin`; key characters outside
//! `[A-Za-z0-9._-]` are percent-encoded.

use crate::repository::Storage;
use crate::StorageError;
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Storage rooted at a directory on disk
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "Opened file storage");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", encode_key(key), ext))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), size = bytes.len(), "Wrote file");
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_json(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match read_optional(&self.path_for(key, "json")).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(&value)?;
        remove_optional(&self.path_for(key, "bin")).await?;
        self.write_atomic(&self.path_for(key, "json"), &bytes).await
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        read_optional(&self.path_for(key, "bin")).await
    }

    async fn set_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        remove_optional(&self.path_for(key, "json")).await?;
        self.write_atomic(&self.path_for(key, "bin"), &bytes).await
    }

    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        for ext in ["json", "bin"] {
            if tokio::fs::try_exists(self.path_for(key, ext)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        remove_optional(&self.path_for(key, "json")).await?;
        remove_optional(&self.path_for(key, "bin")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("profile:civic"), "profile%3Acivic");
        assert_eq!(encode_key("rec.gz:ab-1"), "rec.gz%3Aab-1");
        assert_eq!(encode_key("a/b"), "a%2Fb");
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        storage
            .set_json("profile:x", json!({"id": "x", "strictLock": true}))
            .await
            .unwrap();
        storage.set_blob("rec.gz:1", vec![0x1f, 0x8b]).await.unwrap();

        let reopened = FileStorage::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get_json("profile:x").await.unwrap(),
            Some(json!({"id": "x", "strictLock": true}))
        );
        assert_eq!(
            reopened.get_blob("rec.gz:1").await.unwrap(),
            Some(vec![0x1f, 0x8b])
        );
        assert!(dir.path().join("profile%3Ax.json").exists());
    }

    #[tokio::test]
    async fn test_remove_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("nested")).await.unwrap();
        assert!(!storage.has("k").await.unwrap());
        assert_eq!(storage.get_blob("k").await.unwrap(), None);

        storage.set_blob("k", vec![1]).await.unwrap();
        assert!(storage.has("k").await.unwrap());
        storage.remove("k").await.unwrap();
        assert!(!storage.has("k").await.unwrap());
        storage.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_json_reports_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        assert!(matches!(
            storage.get_json("bad").await,
            Err(StorageError::SerializationError(_))
        ));
    }
}
