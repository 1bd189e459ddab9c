//! In-progress recording buffer

use crate::format::{encode, RecordingFrame, RecordingHeader};
use crate::library::{RecordingLibrary, RecordingMeta};
use crate::RecordingError;
use obd_protocol::CarData;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Uniform spacing of emitted frames (ms)
    pub frame_interval_ms: u64,
    /// Longest gap that is backfilled; older gaps are left as a jump (ms)
    pub max_backfill_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 200,
            max_backfill_ms: 60_000,
        }
    }
}

/// Buffers frames between start and finish.
///
/// Gaps longer than the frame interval are backfilled with copies of the
/// last frame so playback runs at a uniform rate.
pub struct Recorder {
    id: String,
    header: RecordingHeader,
    config: RecorderConfig,
    started: Instant,
    frames: Vec<RecordingFrame>,
}

impl Recorder {
    pub fn start(header: RecordingHeader, config: RecorderConfig) -> Self {
        let id = Uuid::new_v4().to_string();
        info!(id = %id, vin = ?header.vin, "Recording started");
        Self {
            id,
            header,
            config,
            started: Instant::now(),
            frames: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[RecordingFrame] {
        &self.frames
    }

    /// Offset of the last frame
    pub fn duration_ms(&self) -> u64 {
        self.frames.last().map(|f| f.offset_ms).unwrap_or(0)
    }

    /// Append a snapshot at the current time
    pub fn append(&mut self, snapshot: &CarData) {
        let offset_ms = self.started.elapsed().as_millis() as u64;
        self.append_at(offset_ms, snapshot);
    }

    /// Append a snapshot at an explicit offset; offsets never go backwards
    pub fn append_at(&mut self, offset_ms: u64, snapshot: &CarData) {
        let interval = self.config.frame_interval_ms.max(1);
        let mut offset_ms = offset_ms;

        if let Some(last) = self.frames.last().cloned() {
            offset_ms = offset_ms.max(last.offset_ms);
            let gap = offset_ms - last.offset_ms;
            if gap > interval && gap <= self.config.max_backfill_ms {
                let mut t = last.offset_ms + interval;
                let mut filled = 0usize;
                while t < offset_ms {
                    self.frames.push(RecordingFrame {
                        offset_ms: t,
                        data: last.data.clone(),
                    });
                    t += interval;
                    filled += 1;
                }
                debug!(gap_ms = gap, filled, "Backfilled recording gap");
            }
        }

        self.frames.push(RecordingFrame {
            offset_ms,
            data: snapshot.clone(),
        });
    }

    /// Compress the buffer, store it, and index it
    pub async fn finish(self, library: &RecordingLibrary) -> Result<RecordingMeta, RecordingError> {
        let payload = encode(&self.header, &self.frames)?;
        let meta = RecordingMeta {
            id: self.id.clone(),
            created_at: self.header.created_at,
            vehicle: self.header.vehicle.clone(),
            vin: self.header.vin.clone(),
            protocol: self.header.protocol.clone(),
            note: self.header.note.clone(),
            frame_count: self.frames.len(),
            duration_ms: self.duration_ms(),
            byte_size: payload.len(),
        };
        library.store(meta.clone(), payload).await?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use storage::{MemoryStorage, Storage, VehicleIdentity};

    fn snapshot(rpm: f64) -> CarData {
        let mut data = CarData::new();
        data.rpm = Some(rpm);
        data
    }

    fn recorder() -> Recorder {
        Recorder::start(
            RecordingHeader::new(VehicleIdentity::default()),
            RecorderConfig::default(),
        )
    }

    #[test]
    fn test_backfills_uniform_frames() {
        let mut rec = recorder();
        rec.append_at(0, &snapshot(800.0));
        rec.append_at(1000, &snapshot(900.0));

        let offsets: Vec<u64> = rec.frames().iter().map(|f| f.offset_ms).collect();
        assert_eq!(offsets, vec![0, 200, 400, 600, 800, 1000]);
        assert!(rec.frames()[1..5]
            .iter()
            .all(|f| f.data.rpm == Some(800.0)));
        assert_eq!(rec.frames()[5].data.rpm, Some(900.0));
        assert_eq!(rec.duration_ms(), 1000);
    }

    #[test]
    fn test_no_backfill_within_interval() {
        let mut rec = recorder();
        rec.append_at(0, &snapshot(1.0));
        rec.append_at(150, &snapshot(2.0));
        rec.append_at(350, &snapshot(3.0));
        assert_eq!(rec.frame_count(), 3);
    }

    #[test]
    fn test_offsets_never_go_backwards() {
        let mut rec = recorder();
        rec.append_at(500, &snapshot(1.0));
        rec.append_at(100, &snapshot(2.0));
        assert_eq!(rec.frames()[1].offset_ms, 500);
    }

    #[test]
    fn test_long_gap_is_not_backfilled() {
        let mut rec = Recorder::start(
            RecordingHeader::new(VehicleIdentity::default()),
            RecorderConfig {
                frame_interval_ms: 200,
                max_backfill_ms: 1000,
            },
        );
        rec.append_at(0, &snapshot(1.0));
        rec.append_at(5000, &snapshot(2.0));
        assert_eq!(rec.frame_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_uses_elapsed_time() {
        let mut rec = recorder();
        rec.append(&snapshot(1.0));
        tokio::time::sleep(Duration::from_millis(400)).await;
        rec.append(&snapshot(2.0));
        assert_eq!(rec.frame_count(), 3);
        assert_eq!(rec.frames()[1].offset_ms, 200);
        assert!((400..410).contains(&rec.duration_ms()));
    }

    #[tokio::test]
    async fn test_finish_stores_payload_and_meta() {
        let storage = Arc::new(MemoryStorage::new());
        let library = RecordingLibrary::new(storage.clone());
        let mut rec = recorder();
        rec.append_at(0, &snapshot(1.0));
        rec.append_at(400, &snapshot(2.0));
        let id = rec.id().to_string();

        let meta = rec.finish(&library).await.unwrap();
        assert_eq!(meta.id, id);
        assert_eq!(meta.frame_count, 3);
        assert_eq!(meta.duration_ms, 400);
        let blob = storage.get_blob(&format!("rec.gz:{id}")).await.unwrap().unwrap();
        assert_eq!(blob.len(), meta.byte_size);
        assert_eq!(library.list().await.unwrap(), vec![meta]);
    }
}
