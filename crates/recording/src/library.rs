//! Persisted recordings and their metadata index

use crate::format::{decode, RecordingFrame, RecordingHeader};
use crate::RecordingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::{load, save, Storage, VehicleIdentity};
use tracing::{info, warn};

/// Storage key of the metadata index
pub const INDEX_KEY: &str = "recordings:index";

/// Storage key of a compressed payload
pub fn payload_key(id: &str) -> String {
    format!("rec.gz:{id}")
}

/// Index entry describing one stored recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub vehicle: VehicleIdentity,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub frame_count: usize,
    /// Offset of the last frame
    pub duration_ms: u64,
    /// Size of the compressed payload
    pub byte_size: usize,
}

/// A decoded recording
#[derive(Debug, Clone)]
pub struct Recording {
    pub meta: RecordingMeta,
    pub header: RecordingHeader,
    pub frames: Vec<RecordingFrame>,
}

/// Recording store over a [`Storage`] backend
#[derive(Clone)]
pub struct RecordingLibrary {
    storage: Arc<dyn Storage>,
}

impl RecordingLibrary {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// All recordings, newest first
    pub async fn list(&self) -> Result<Vec<RecordingMeta>, RecordingError> {
        Ok(load(self.storage.as_ref(), INDEX_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn get(&self, id: &str) -> Result<Option<RecordingMeta>, RecordingError> {
        Ok(self.list().await?.into_iter().find(|meta| meta.id == id))
    }

    /// Store a compressed payload and upsert its index entry
    pub async fn store(&self, meta: RecordingMeta, payload: Vec<u8>) -> Result<(), RecordingError> {
        self.storage.set_blob(&payload_key(&meta.id), payload).await?;

        let mut index = self.list().await?;
        index.retain(|entry| entry.id != meta.id);
        info!(
            id = %meta.id,
            frames = meta.frame_count,
            duration_ms = meta.duration_ms,
            bytes = meta.byte_size,
            "Recording stored"
        );
        index.push(meta);
        index.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        save(self.storage.as_ref(), INDEX_KEY, &index).await?;
        Ok(())
    }

    /// Load and decode a recording by id
    pub async fn load(&self, id: &str) -> Result<Recording, RecordingError> {
        let meta = self
            .get(id)
            .await?
            .ok_or_else(|| RecordingError::NotFound(id.to_string()))?;
        let payload = self
            .storage
            .get_blob(&payload_key(id))
            .await?
            .ok_or_else(|| RecordingError::NotFound(payload_key(id)))?;
        let (header, frames) = decode(&payload)?;
        if frames.len() != meta.frame_count {
            warn!(
                id,
                indexed = meta.frame_count,
                decoded = frames.len(),
                "Recording frame count differs from index"
            );
        }
        Ok(Recording {
            meta,
            header,
            frames,
        })
    }

    /// Remove a recording's payload and index entry
    pub async fn delete(&self, id: &str) -> Result<bool, RecordingError> {
        let mut index = self.list().await?;
        let before = index.len();
        index.retain(|entry| entry.id != id);
        let removed = index.len() != before;

        self.storage.remove(&payload_key(id)).await?;
        if removed {
            save(self.storage.as_ref(), INDEX_KEY, &index).await?;
            info!(id, "Recording deleted");
        }
        Ok(removed)
    }
}
