//! Gzip NDJSON encoding

use crate::RecordingError;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use obd_protocol::CarData;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use storage::VehicleIdentity;

/// Schema tag written in every header
pub const SCHEMA: &str = "obd-telemetry/1";

/// First line of a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingHeader {
    pub schema: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub vehicle: VehicleIdentity,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl RecordingHeader {
    pub fn new(vehicle: VehicleIdentity) -> Self {
        Self {
            schema: SCHEMA.to_string(),
            created_at: Utc::now(),
            vehicle,
            vin: None,
            protocol: None,
            note: None,
        }
    }

    pub fn with_vin(mut self, vin: Option<String>) -> Self {
        self.vin = vin;
        self
    }

    pub fn with_protocol(mut self, protocol: Option<String>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// One sample, offset from recording start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingFrame {
    #[serde(rename = "t")]
    pub offset_ms: u64,
    pub data: CarData,
}

/// Serialize and gzip a header plus frames
pub fn encode(
    header: &RecordingHeader,
    frames: &[RecordingFrame],
) -> Result<Vec<u8>, RecordingError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, header)?;
    encoder.write_all(b"\n")?;
    for frame in frames {
        serde_json::to_writer(&mut encoder, frame)?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

/// Decompress and parse a recording; blank lines are ignored
pub fn decode(bytes: &[u8]) -> Result<(RecordingHeader, Vec<RecordingFrame>), RecordingError> {
    let reader = BufReader::new(GzDecoder::new(bytes));
    let mut lines = reader.lines().filter(|line| match line {
        Ok(text) => !text.trim().is_empty(),
        Err(_) => true,
    });

    let first = lines
        .next()
        .ok_or_else(|| RecordingError::Format("empty recording".to_string()))??;
    let header: RecordingHeader = serde_json::from_str(&first)?;
    if header.schema != SCHEMA {
        return Err(RecordingError::Format(format!(
            "unsupported schema {}",
            header.schema
        )));
    }

    let mut frames = Vec::new();
    for line in lines {
        frames.push(serde_json::from_str(&line?)?);
    }
    Ok((header, frames))
}
