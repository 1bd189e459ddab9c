//! Subcommand implementations

use anyhow::{bail, Context, Result};
use obd_connection::{
    select_adapter, AdapterDiscovery, ConnectionEvent, ConnectionManager, ConnectionState, Settings,
};
use obd_protocol::DtcKind;
use recording::{spawn_replay, RecordingLibrary, ReplayEvent};
use std::time::Duration;
use storage::{load_profile, save_profile, Storage, VehicleIdentity, VehicleProfile};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub struct NewProfile {
    pub id: String,
    pub make: String,
    pub model: String,
    pub year: Option<u16>,
    pub vin: Option<String>,
    pub strict_lock: bool,
}

pub async fn adapters(discovery: &dyn AdapterDiscovery, settings: &Settings) -> Result<()> {
    let found = discovery.scan().await.context("Adapter scan failed")?;
    if found.is_empty() {
        println!("No adapters found");
        return Ok(());
    }
    let picked = select_adapter(&found, None, &settings.connection.adapter_patterns);
    for adapter in &found {
        let marker = if picked == Some(adapter) { "*" } else { " " };
        println!("{marker} {:<24} {}", adapter.id, adapter.label);
    }
    Ok(())
}

pub async fn show_profile(storage: &dyn Storage, id: &str) -> Result<()> {
    let Some(profile) = load_profile(storage, id).await? else {
        bail!("Profile {id} not found");
    };
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

pub async fn create_profile(storage: &dyn Storage, new: NewProfile) -> Result<()> {
    let mut profile = VehicleProfile::new(
        new.id,
        VehicleIdentity {
            year: new.year,
            make: new.make,
            model: new.model,
            engine: None,
        },
    );
    profile.learned.vin = new.vin.map(|vin| vin.trim().to_ascii_uppercase());
    profile.strict_lock = new.strict_lock;
    save_profile(storage, &profile).await?;
    println!("Saved profile {} ({})", profile.id, profile.display_name());
    Ok(())
}

pub async fn list_recordings(library: &RecordingLibrary) -> Result<()> {
    let recordings = library.list().await?;
    if recordings.is_empty() {
        println!("No recordings");
    }
    for meta in recordings {
        println!(
            "{}  {}  {:>6} frames  {:>7.1}s  {}",
            meta.id,
            meta.created_at.format("%Y-%m-%d %H:%M"),
            meta.frame_count,
            meta.duration_ms as f64 / 1000.0,
            meta.note.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn delete_recording(library: &RecordingLibrary, id: &str) -> Result<()> {
    if !library.delete(id).await? {
        bail!("Recording {id} not found");
    }
    println!("Deleted {id}");
    Ok(())
}

/// Print each frame as a JSON line at its scaled time
pub async fn replay(library: &RecordingLibrary, id: &str, speed: f64) -> Result<()> {
    let recording = library.load(id).await?;
    info!(
        id,
        frames = recording.frames.len(),
        vehicle = %recording.meta.vehicle.make,
        "Replaying"
    );
    let (handle, mut events) = spawn_replay(recording.frames, speed)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => handle.stop(),
            event = events.recv() => match event {
                Some(ReplayEvent::Frame(frame)) => println!("{}", serde_json::to_string(&frame)?),
                Some(ReplayEvent::Finished(summary)) => {
                    info!(frames = summary.frames_emitted, stopped = summary.stopped, "Replay finished");
                    break;
                }
                None => break,
            },
        }
    }
    handle.join().await;
    Ok(())
}

/// Connect, poll and print snapshots until Ctrl-C, the deadline, or the
/// adapter drops.
pub async fn monitor(
    manager: &ConnectionManager,
    record: bool,
    note: Option<String>,
    duration: Option<u64>,
) -> Result<()> {
    let state = manager.connect().await?;
    if state != ConnectionState::Live {
        manager.disconnect().await;
        if state == ConnectionState::AdapterOnly {
            bail!("Adapter connected but the ECU is not answering (ignition on?)");
        }
        bail!("Not connected ({state})");
    }
    if let Some(fp) = manager.fingerprint() {
        info!(vin = ?fp.vin, protocol = %fp.protocol, pids = fp.supported_pids.len(), "Vehicle identified");
    }

    manager.start_polling()?;
    if record {
        let id = manager.start_recording(note)?;
        info!(id = %id, "Recording");
    }

    let mut snapshots = manager.snapshots();
    let mut events = manager.subscribe();
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = snapshots
                    .borrow_and_update()
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                if let Some(line) = line {
                    println!("{line}");
                }
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::PidDemoted(d)) => info!(pid = %d.pid, to = %d.to, "PID slowed down"),
                Ok(ConnectionEvent::PollingStopped { error: Some(error) }) => {
                    warn!(%error, "Lost the vehicle");
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(meta) = manager.stop_recording().await? {
        println!("Saved recording {} ({} frames)", meta.id, meta.frame_count);
    }
    manager.disconnect().await;
    Ok(())
}

pub async fn codes(manager: &ConnectionManager, kind: DtcKind, clear: bool) -> Result<()> {
    let state = manager.connect().await?;
    if !matches!(state, ConnectionState::Live | ConnectionState::AdapterOnly) {
        bail!("Not connected ({state})");
    }

    let result = async {
        if clear {
            if manager.clear_dtcs().await? {
                println!("Trouble codes cleared");
            } else {
                warn!("ECU did not confirm the clear");
            }
        }
        let found = manager.read_dtcs(kind).await?;
        if found.is_empty() {
            println!("No {kind:?} codes");
        }
        for dtc in found {
            println!("{dtc}");
        }
        anyhow::Ok(())
    }
    .await;

    manager.disconnect().await;
    result
}
