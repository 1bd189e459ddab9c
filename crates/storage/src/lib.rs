//! Storage Layer
//!
//! Key-addressed persistence for JSON values and byte blobs behind the
//! [`Storage`] trait, with an in-memory and a directory-backed
//! implementation, plus the persisted vehicle profile model.

mod file;
mod profile;
mod repository;

pub use file::FileStorage;
pub use profile::{
    load_profile, profile_key, save_profile, ConnectionHints, GaugeHints, LearnedData,
    VehicleIdentity, VehicleProfile,
};
pub use repository::{load, save, MemoryStorage, Storage};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}
