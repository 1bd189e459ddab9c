//! Time-scaled playback of recorded frames

use crate::format::RecordingFrame;
use crate::RecordingError;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Replay output
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEvent {
    Frame(RecordingFrame),
    /// Sent once, after the last frame or on stop
    Finished(ReplaySummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub frames_emitted: usize,
    pub stopped: bool,
}

/// Control handle for a running replay
pub struct ReplayHandle {
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    task: JoinHandle<ReplaySummary>,
}

impl ReplayHandle {
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            debug!("Replay paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            debug!("Replay resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the replay to end
    pub async fn join(self) -> ReplaySummary {
        self.task.await.unwrap_or(ReplaySummary {
            frames_emitted: 0,
            stopped: true,
        })
    }
}

/// Start streaming `frames`, emitting each at `offset / speed` after start
pub fn spawn_replay(
    frames: Vec<RecordingFrame>,
    speed: f64,
) -> Result<(ReplayHandle, mpsc::Receiver<ReplayEvent>), RecordingError> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(RecordingError::InvalidSpeed(speed));
    }

    let (tx, rx) = mpsc::channel(64);
    let (paused_tx, paused_rx) = watch::channel(false);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run_replay(frames, speed, tx, paused_rx, cancel.clone()));

    Ok((
        ReplayHandle {
            paused: paused_tx,
            cancel,
            task,
        },
        rx,
    ))
}

async fn run_replay(
    frames: Vec<RecordingFrame>,
    speed: f64,
    tx: mpsc::Sender<ReplayEvent>,
    mut paused: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> ReplaySummary {
    info!(frames = frames.len(), speed, "Replay started");
    let started = Instant::now();
    let mut paused_total = Duration::ZERO;
    let mut emitted = 0usize;
    let mut stopped = false;
    let mut controls_open = true;

    'frames: for frame in frames {
        let target = Duration::from_secs_f64(frame.offset_ms as f64 / 1000.0 / speed);
        loop {
            if cancel.is_cancelled() {
                stopped = true;
                break 'frames;
            }

            if controls_open && *paused.borrow_and_update() {
                let pause_started = Instant::now();
                while *paused.borrow_and_update() {
                    tokio::select! {
                        changed = paused.changed() => {
                            // Handle dropped while paused: resume
                            if changed.is_err() {
                                controls_open = false;
                                break;
                            }
                        }
                        _ = cancel.cancelled() => {
                            stopped = true;
                            break 'frames;
                        }
                    }
                }
                paused_total += pause_started.elapsed();
                continue;
            }

            let elapsed = started.elapsed().saturating_sub(paused_total);
            if elapsed >= target {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(target - elapsed) => {}
                changed = paused.changed(), if controls_open => {
                    // Handle dropped: play to the end
                    if changed.is_err() {
                        controls_open = false;
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }

        if tx.send(ReplayEvent::Frame(frame)).await.is_err() {
            stopped = true;
            break;
        }
        emitted += 1;
    }

    let summary = ReplaySummary {
        frames_emitted: emitted,
        stopped,
    };
    let _ = tx.send(ReplayEvent::Finished(summary)).await;
    info!(emitted, stopped, "Replay finished");
    summary
}
