//! Telemetry Recording and Replay
//!
//! Recordings are newline-delimited JSON, gzip-compressed: one header line
//! followed by `{"t": <offsetMs>, "data": <snapshot>}` frames spaced at a
//! uniform interval. Payloads live under `rec.gz:<id>` with a metadata index
//! under `recordings:index`.

mod format;
mod library;
mod recorder;
mod replay;

pub use format::{decode, encode, RecordingFrame, RecordingHeader, SCHEMA};
pub use library::{payload_key, Recording, RecordingLibrary, RecordingMeta, INDEX_KEY};
pub use recorder::{Recorder, RecorderConfig};
pub use replay::{spawn_replay, ReplayEvent, ReplayHandle, ReplaySummary};

use thiserror::Error;

/// Recording errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Recording not found: {0}")]
    NotFound(String),

    #[error("Malformed recording: {0}")]
    Format(String),

    #[error("Invalid replay speed: {0}")]
    InvalidSpeed(f64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RecordingError {
    fn from(err: serde_json::Error) -> Self {
        RecordingError::Format(err.to_string())
    }
}
