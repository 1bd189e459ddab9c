//! Connection Manager
//!
//! One manager per vehicle connection. It owns the protocol engine, the
//! current profile, the polling task and the in-progress recording; every
//! piece of mutable state is scoped to this instance.

use crate::discovery::{select_adapter, AdapterDiscovery, AdapterInfo};
use crate::matching::{match_profile, merge_learned, ProfileMatch};
use crate::settings::Settings;
use crate::ConnectionError;
use chrono::Utc;
use obd_protocol::{
    CarData, ConnectHints, ConnectOutcome, Dtc, DtcKind, EcuFingerprint, ObdClient, ObdError,
    ObdProtocol, PidRegistry,
};
use obd_scheduler::{Demotion, PidScheduler, SnapshotSink};
use parking_lot::{Mutex, RwLock};
use recording::{Recorder, RecordingHeader, RecordingLibrary, RecordingMeta};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::{load_profile, save_profile, ConnectionHints, Storage, VehicleProfile};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    /// Adapter answers, ECU does not
    AdapterOnly,
    Live,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AdapterOnly => "adapter-only",
            ConnectionState::Live => "live",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Published on the manager's event channel
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    AdapterSelected(AdapterInfo),
    Fingerprint(EcuFingerprint),
    ProfileChecked(ProfileMatch),
    ProfileUpdated(VehicleProfile),
    PidDemoted(Demotion),
    PollingStopped { error: Option<String> },
    RecordingStarted(String),
    RecordingSaved(RecordingMeta),
}

struct Poller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    settings: Settings,
    discovery: Arc<dyn AdapterDiscovery>,
    storage: Arc<dyn Storage>,
    library: RecordingLibrary,
    registry: PidRegistry,
    state: RwLock<ConnectionState>,
    client: RwLock<Option<Arc<ObdClient>>>,
    profile: RwLock<Option<VehicleProfile>>,
    connect_cancel: Mutex<Option<CancellationToken>>,
    poller: Mutex<Option<Poller>>,
    recorder: Mutex<Option<Recorder>>,
    events: broadcast::Sender<ConnectionEvent>,
    latest: watch::Sender<Option<CarData>>,
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            info!(from = %previous, to = %next, "Connection state changed");
            self.emit(ConnectionEvent::StateChanged(next));
        }
    }

    fn client(&self) -> Option<Arc<ObdClient>> {
        self.client.read().clone()
    }
}

/// Feeds scheduler output to subscribers and the active recording
struct LiveSink {
    inner: Arc<Inner>,
}

impl SnapshotSink for LiveSink {
    fn publish(&mut self, snapshot: &CarData) {
        self.inner.latest.send_replace(Some(snapshot.clone()));
        if let Some(recorder) = self.inner.recorder.lock().as_mut() {
            recorder.append(snapshot);
        }
    }

    fn demoted(&mut self, demotion: &Demotion) {
        self.inner.emit(ConnectionEvent::PidDemoted(demotion.clone()));
    }
}

/// An in-flight connect or reconnect.
///
/// Dropped without `finish` (the caller's future was dropped), it cancels
/// the attempt, closes the transport it was working on and leaves the
/// manager `Disconnected`.
struct Attempt {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    opened: Mutex<Option<Arc<ObdClient>>>,
    finished: bool,
}

impl Attempt {
    fn track(&self, client: &Arc<ObdClient>) {
        *self.opened.lock() = Some(Arc::clone(client));
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        *self.inner.connect_cancel.lock() = None;
        if self.finished {
            return;
        }
        warn!("Connect attempt abandoned");
        self.cancel.cancel();
        if let Some(client) = self.opened.lock().take() {
            {
                let mut slot = self.inner.client.write();
                if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &client)) {
                    *slot = None;
                }
            }
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { client.disconnect().await });
                }
                Err(_) => warn!("No runtime left to close the abandoned transport"),
            }
        }
        self.inner.latest.send_replace(None);
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

/// Connection orchestrator. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        settings: Settings,
        discovery: Arc<dyn AdapterDiscovery>,
        storage: Arc<dyn Storage>,
        registry: PidRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.connection.event_capacity.max(1));
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                library: RecordingLibrary::new(Arc::clone(&storage)),
                settings,
                discovery,
                storage,
                registry,
                state: RwLock::new(ConnectionState::Idle),
                client: RwLock::new(None),
                profile: RwLock::new(None),
                connect_cancel: Mutex::new(None),
                poller: Mutex::new(None),
                recorder: Mutex::new(None),
                events,
                latest,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Latest published snapshot; `None` until polling produces one
    pub fn snapshots(&self) -> watch::Receiver<Option<CarData>> {
        self.inner.latest.subscribe()
    }

    pub fn profile(&self) -> Option<VehicleProfile> {
        self.inner.profile.read().clone()
    }

    pub fn set_profile(&self, profile: Option<VehicleProfile>) {
        *self.inner.profile.write() = profile;
    }

    /// Load a stored profile and make it current
    pub async fn load_profile(&self, id: &str) -> Result<Option<VehicleProfile>, ConnectionError> {
        let profile = load_profile(self.inner.storage.as_ref(), id).await?;
        if profile.is_none() {
            warn!(profile = id, "Profile not found");
        }
        self.set_profile(profile.clone());
        Ok(profile)
    }

    pub fn fingerprint(&self) -> Option<EcuFingerprint> {
        self.inner.client().and_then(|client| client.fingerprint())
    }

    /// Active protocol description, empty without an adapter session
    pub fn protocol(&self) -> String {
        self.inner
            .client()
            .map(|client| client.protocol_description())
            .unwrap_or_default()
    }

    pub fn recordings(&self) -> &RecordingLibrary {
        &self.inner.library
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .as_ref()
            .is_some_and(|poller| !poller.task.is_finished())
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recorder.lock().is_some()
    }

    /// Discover an adapter, connect, wake the ECU and validate the vehicle.
    ///
    /// Returns `Idle` when no adapter is visible and `AdapterOnly` when the
    /// ECU never answered. A hard profile mismatch under strict lock, any
    /// handshake failure and cancellation leave the manager `Disconnected`
    /// with the transport closed.
    pub async fn connect(&self) -> Result<ConnectionState, ConnectionError> {
        let attempt = self.begin_attempt()?;
        if self.inner.client().is_some() {
            self.teardown().await;
        }

        let result = self.run_connect(&attempt).await;
        attempt.finish();
        if let Err(e) = &result {
            if e.is_cancelled() {
                info!("Connect cancelled");
            } else {
                warn!(error = %e, "Connect failed");
            }
            self.inner.set_state(ConnectionState::Disconnected);
        }
        result
    }

    /// Re-probe the ECU over the existing adapter session and refresh the
    /// fingerprint, skipping protocol detection.
    pub async fn reconnect(&self) -> Result<ConnectionState, ConnectionError> {
        let client = self.inner.client().ok_or(ConnectionError::NotConnected)?;
        let attempt = self.begin_attempt()?;
        attempt.track(&client);
        self.stop_polling().await;
        self.inner.set_state(ConnectionState::Connecting);

        let result = match client.reprobe(&attempt.cancel).await {
            Ok(outcome) => self.settle(&client, outcome).await,
            Err(e) => Err(e.into()),
        };
        attempt.finish();
        if let Err(e) = &result {
            warn!(error = %e, "Reconnect failed");
            self.teardown().await;
        }
        result
    }

    /// Abort an in-flight connect or reconnect. Returns whether one was running.
    pub fn cancel_connect(&self) -> bool {
        match self.inner.connect_cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop everything and close the adapter
    pub async fn disconnect(&self) {
        self.cancel_connect();
        if self.is_recording() {
            if let Err(e) = self.stop_recording().await {
                warn!(error = %e, "Failed to save recording on disconnect");
            }
        }
        self.teardown().await;
    }

    /// Start the live polling loop. Returns `false` if one is already running.
    pub fn start_polling(&self) -> Result<bool, ConnectionError> {
        let mut slot = self.inner.poller.lock();
        if slot.as_ref().is_some_and(|poller| !poller.task.is_finished()) {
            debug!("Polling already running");
            return Ok(false);
        }
        if self.state() != ConnectionState::Live {
            return Err(ConnectionError::NotLive);
        }
        let client = self.inner.client().ok_or(ConnectionError::NotLive)?;

        let desired = self
            .inner
            .profile
            .read()
            .as_ref()
            .map(|profile| profile.preferred_pids.clone())
            .unwrap_or_default();
        let mut scheduler = PidScheduler::new(
            self.inner.settings.scheduler.clone(),
            client.bus(),
            &desired,
            |pid| client.supports_pid(pid),
            &self.inner.registry,
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut sink = LiveSink {
                inner: Arc::clone(&inner),
            };
            match scheduler.run(&client, &mut sink, &token).await {
                Ok(()) => inner.emit(ConnectionEvent::PollingStopped { error: None }),
                Err(e) => {
                    warn!(error = %e, "Polling lost the adapter");
                    inner.emit(ConnectionEvent::PollingStopped {
                        error: Some(e.to_string()),
                    });
                    let current = {
                        let mut slot = inner.client.write();
                        let same = slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, &client));
                        if same {
                            *slot = None;
                        }
                        same
                    };
                    if current {
                        client.disconnect().await;
                        inner.set_state(ConnectionState::Disconnected);
                    }
                }
            }
        });

        *slot = Some(Poller { cancel, task });
        info!("Live polling started");
        Ok(true)
    }

    /// Stop the polling loop and wait for it to finish
    pub async fn stop_polling(&self) {
        let poller = self.inner.poller.lock().take();
        if let Some(poller) = poller {
            poller.cancel.cancel();
            if let Err(e) = poller.task.await {
                warn!(error = %e, "Polling task ended abnormally");
            }
        }
    }

    /// Begin recording published snapshots; returns the recording id
    pub fn start_recording(&self, note: Option<String>) -> Result<String, ConnectionError> {
        let mut slot = self.inner.recorder.lock();
        if let Some(recorder) = slot.as_ref() {
            debug!(id = recorder.id(), "Recording already running");
            return Ok(recorder.id().to_string());
        }

        let identity = self
            .inner
            .profile
            .read()
            .as_ref()
            .map(|profile| profile.identity.clone())
            .unwrap_or_default();
        let fingerprint = self.fingerprint();
        let protocol = Some(self.protocol()).filter(|p| !p.is_empty());
        let mut header = RecordingHeader::new(identity)
            .with_vin(fingerprint.and_then(|fp| fp.vin))
            .with_protocol(protocol);
        if let Some(note) = note {
            header = header.with_note(note);
        }

        let recorder = Recorder::start(header, self.inner.settings.recorder.clone());
        let id = recorder.id().to_string();
        *slot = Some(recorder);
        drop(slot);
        self.inner.emit(ConnectionEvent::RecordingStarted(id.clone()));
        Ok(id)
    }

    /// Finish and store the active recording, if any
    pub async fn stop_recording(&self) -> Result<Option<RecordingMeta>, ConnectionError> {
        let recorder = self.inner.recorder.lock().take();
        let Some(recorder) = recorder else {
            return Ok(None);
        };
        let meta = recorder.finish(&self.inner.library).await?;
        self.inner.emit(ConnectionEvent::RecordingSaved(meta.clone()));
        Ok(Some(meta))
    }

    /// Read trouble codes; works with the ECU asleep (the list is then empty)
    pub async fn read_dtcs(&self, kind: DtcKind) -> Result<Vec<Dtc>, ConnectionError> {
        let client = self.inner.client().ok_or(ConnectionError::NotConnected)?;
        Ok(client.read_dtcs(kind).await?)
    }

    /// Clear stored and pending trouble codes
    pub async fn clear_dtcs(&self) -> Result<bool, ConnectionError> {
        let client = self.inner.client().ok_or(ConnectionError::NotConnected)?;
        Ok(client.clear_dtcs().await?)
    }

    fn begin_attempt(&self) -> Result<Attempt, ConnectionError> {
        let mut slot = self.inner.connect_cancel.lock();
        if slot.is_some() {
            return Err(ConnectionError::AlreadyConnecting);
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        Ok(Attempt {
            inner: Arc::clone(&self.inner),
            cancel,
            opened: Mutex::new(None),
            finished: false,
        })
    }

    async fn run_connect(&self, attempt: &Attempt) -> Result<ConnectionState, ConnectionError> {
        let cancel = &attempt.cancel;
        self.inner.set_state(ConnectionState::Connecting);
        let hints = self
            .inner
            .profile
            .read()
            .as_ref()
            .map(|profile| profile.hints.clone())
            .unwrap_or_default();

        let adapters = cancellable(cancel, self.inner.discovery.scan()).await?;
        let Some(adapter) = select_adapter(
            &adapters,
            hints.adapter_name.as_deref(),
            &self.inner.settings.connection.adapter_patterns,
        )
        .cloned() else {
            warn!(visible = adapters.len(), "No OBD adapter found");
            self.inner.set_state(ConnectionState::Idle);
            return Ok(ConnectionState::Idle);
        };
        info!(adapter = %adapter.label, id = %adapter.id, "Adapter selected");
        self.inner.emit(ConnectionEvent::AdapterSelected(adapter.clone()));

        let transport = cancellable(cancel, self.inner.discovery.open(&adapter)).await?;
        let client = Arc::new(ObdClient::new(transport, self.inner.settings.client.clone()));
        attempt.track(&client);
        let result = self.handshake(&client, &connect_hints(&hints), cancel).await;
        if result.is_err() {
            client.disconnect().await;
        }
        result
    }

    async fn handshake(
        &self,
        client: &Arc<ObdClient>,
        hints: &ConnectHints,
        cancel: &CancellationToken,
    ) -> Result<ConnectionState, ConnectionError> {
        let mut outcome = client.connect(hints, cancel).await?;
        if !outcome.ecu_awake {
            outcome = self.wake_ladder(client, cancel).await?;
        }
        self.settle(client, outcome).await
    }

    /// Probe under auto, then force each ladder protocol in turn
    async fn wake_ladder(
        &self,
        client: &ObdClient,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome, ConnectionError> {
        let config = &self.inner.settings.connection;
        info!("ECU asleep, running wake ladder");
        let mut outcome = client
            .try_protocol(ObdProtocol::Auto, config.wake_probes, cancel)
            .await?;
        for protocol in &config.wake_ladder {
            if outcome.ecu_awake {
                break;
            }
            debug!(protocol = protocol.description(), "Wake ladder step");
            outcome = client.try_protocol(*protocol, config.wake_probes, cancel).await?;
        }
        if !outcome.ecu_awake {
            // Leave the adapter searching so a later reconnect can find the bus
            let timeout = Duration::from_millis(client.config().command_timeout_ms);
            cancellable(
                cancel,
                client.send_command(ObdProtocol::Auto.to_elm_command(), timeout, true),
            )
            .await?;
            warn!(adapter = client.name(), "Adapter connected, ECU offline");
        }
        Ok(outcome)
    }

    /// Apply a connect outcome: validate, learn, publish the new state
    async fn settle(
        &self,
        client: &Arc<ObdClient>,
        outcome: ConnectOutcome,
    ) -> Result<ConnectionState, ConnectionError> {
        let state = match (outcome.ecu_awake, outcome.fingerprint) {
            (false, _) => ConnectionState::AdapterOnly,
            (true, Some(fingerprint)) => {
                self.inner
                    .emit(ConnectionEvent::Fingerprint(fingerprint.clone()));
                self.verify_profile(&fingerprint)?;
                if let Err(e) = self.learn(&fingerprint).await {
                    warn!(error = %e, "Failed to persist learned vehicle data");
                }
                ConnectionState::Live
            }
            (true, None) => ConnectionState::Live,
        };

        *self.inner.client.write() = Some(Arc::clone(client));
        self.inner.set_state(state);
        Ok(state)
    }

    fn verify_profile(&self, fingerprint: &EcuFingerprint) -> Result<(), ConnectionError> {
        let Some(profile) = self.profile() else {
            return Ok(());
        };
        let verdict = match_profile(&profile, fingerprint);
        self.inner.emit(ConnectionEvent::ProfileChecked(verdict));

        let expected = profile
            .learned
            .vin
            .clone()
            .unwrap_or_else(|| profile.display_name());
        let found = fingerprint.vin.clone().unwrap_or_else(|| "no VIN".to_string());
        match verdict {
            ProfileMatch::HardMismatch if profile.strict_lock => {
                warn!(profile = %profile.id, %expected, %found, "Vehicle does not match profile");
                return Err(ConnectionError::ProfileMismatch {
                    profile: profile.id,
                    expected,
                    found,
                });
            }
            ProfileMatch::HardMismatch => {
                warn!(profile = %profile.id, %expected, %found, "Vehicle mismatch ignored, strict lock disabled");
            }
            ProfileMatch::SoftMismatch => {
                warn!(profile = %profile.id, year = ?fingerprint.model_year, "Model year differs from profile");
            }
            ProfileMatch::SoftUnknown => {
                info!(profile = %profile.id, %found, "VIN could not be compared");
            }
            ProfileMatch::Match => debug!(profile = %profile.id, "Vehicle matches profile"),
        }
        Ok(())
    }

    async fn learn(&self, fingerprint: &EcuFingerprint) -> Result<(), ConnectionError> {
        let updated = {
            let mut guard = self.inner.profile.write();
            let Some(profile) = guard.as_mut() else {
                return Ok(());
            };
            profile.learned.last_connected = Some(Utc::now());
            if !merge_learned(&mut profile.learned, fingerprint) {
                debug!(profile = %profile.id, "Learned data unchanged, skipping write");
                return Ok(());
            }
            profile.clone()
        };

        save_profile(self.inner.storage.as_ref(), &updated).await?;
        info!(
            profile = %updated.id,
            vin = ?updated.learned.vin,
            pids = updated.learned.supported_pids.len(),
            "Learned vehicle data saved"
        );
        self.inner.emit(ConnectionEvent::ProfileUpdated(updated));
        Ok(())
    }

    async fn teardown(&self) {
        self.stop_polling().await;
        let client = self.inner.client.write().take();
        if let Some(client) = client {
            client.disconnect().await;
        }
        self.inner.latest.send_replace(None);
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

fn connect_hints(hints: &ConnectionHints) -> ConnectHints {
    let protocol = hints.protocol_hint.as_deref().and_then(|hint| {
        let parsed = ObdProtocol::from_hint(hint);
        if parsed.is_none() {
            warn!(hint, "Ignoring unrecognised protocol hint");
        }
        parsed
    });
    ConnectHints {
        protocol,
        init_script: hints.init_script.clone(),
        can_header: hints.can_header.clone(),
        can_receive_filter: hints.can_receive_filter.clone(),
    }
}

async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, ConnectionError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ConnectionError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ObdError::Cancelled.into()),
        result = fut => result.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::SimulatorDiscovery;
    use obd_protocol::mock::MockEcu;
    use obd_scheduler::PollGroup;
    use storage::{MemoryStorage, VehicleIdentity};

    struct Harness {
        manager: ConnectionManager,
        discovery: Arc<SimulatorDiscovery>,
        storage: Arc<MemoryStorage>,
    }

    fn harness(ecu: MockEcu, profile: Option<VehicleProfile>) -> Harness {
        let discovery = Arc::new(SimulatorDiscovery::new(ecu));
        let storage = Arc::new(MemoryStorage::new());
        let manager = ConnectionManager::new(
            Settings::default(),
            discovery.clone(),
            storage.clone(),
            PidRegistry::with_standard_pids(),
        );
        manager.set_profile(profile);
        Harness {
            manager,
            discovery,
            storage,
        }
    }

    fn fiesta(vin: Option<&str>) -> VehicleProfile {
        let mut profile = VehicleProfile::new(
            "fiesta",
            VehicleIdentity {
                year: Some(2014),
                make: "Ford".into(),
                model: "Fiesta".into(),
                engine: None,
            },
        );
        profile.learned.vin = vin.map(str::to_string);
        profile
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_learns_polls_and_records() {
        let h = harness(MockEcu::can(), Some(fiesta(None)));
        let mut events = h.manager.subscribe();

        assert_eq!(h.manager.connect().await.unwrap(), ConnectionState::Live);
        let saved = load_profile(h.storage.as_ref(), "fiesta").await.unwrap().unwrap();
        assert_eq!(saved.learned.vin.as_deref(), Some("1FADP3F20EL123456"));
        assert!(saved.learned.supported_pids.contains(&"010C".to_string()));
        assert_eq!(h.storage.write_count(), 1);

        assert!(h.manager.start_polling().unwrap());
        assert!(!h.manager.start_polling().unwrap());
        let id = h.manager.start_recording(Some("test drive".into())).unwrap();

        let mut snapshots = h.manager.snapshots();
        let snapshot = snapshots
            .wait_for(|s| s.is_some())
            .await
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(snapshot.rpm, Some(800.0));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let meta = h.manager.stop_recording().await.unwrap().unwrap();
        assert_eq!(meta.id, id);
        assert_eq!(meta.vin.as_deref(), Some("1FADP3F20EL123456"));
        assert!(meta.frame_count >= 5);
        let recording = h.manager.recordings().load(&id).await.unwrap();
        assert_eq!(recording.header.note.as_deref(), Some("test drive"));

        h.manager.disconnect().await;
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(!h.manager.is_polling());
        assert!(!h.discovery.last_handle().unwrap().is_connected());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ProfileChecked(ProfileMatch::SoftUnknown))));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StateChanged(ConnectionState::Live))));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::RecordingSaved(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_learned_data_is_not_rewritten() {
        let h = harness(MockEcu::can(), Some(fiesta(None)));
        h.manager.connect().await.unwrap();
        assert_eq!(h.storage.write_count(), 1);

        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Live);
        assert_eq!(h.storage.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_mismatch_aborts() {
        let h = harness(MockEcu::can(), Some(fiesta(Some("1FADP3F20EL999999"))));
        let err = h.manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ProfileMismatch { .. }));
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(!h.discovery.last_handle().unwrap().is_connected());
        assert_eq!(h.storage.write_count(), 0);
        assert!(matches!(
            h.manager.start_polling(),
            Err(ConnectionError::NotLive)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatch_tolerated_without_strict_lock() {
        let mut profile = fiesta(Some("1FADP3F20EL999999"));
        profile.strict_lock = false;
        let h = harness(MockEcu::can(), Some(profile));
        assert_eq!(h.manager.connect().await.unwrap(), ConnectionState::Live);
        let saved = load_profile(h.storage.as_ref(), "fiesta").await.unwrap().unwrap();
        assert_eq!(saved.learned.vin.as_deref(), Some("1FADP3F20EL999999"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_handshake_then_reconnect_cleanly() {
        let ecu = MockEcu::can().response_delay(Duration::from_millis(300));
        let h = harness(ecu, None);

        let manager = h.manager.clone();
        let attempt = tokio::spawn(async move { manager.connect().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        assert!(h.manager.cancel_connect());

        let err = attempt.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(!h.discovery.handles()[0].is_connected());
        assert!(!h.manager.cancel_connect());

        assert_eq!(h.manager.connect().await.unwrap(), ConnectionState::Live);
        assert_eq!(h.discovery.handles().len(), 2);
        assert!(h.discovery.last_handle().unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connect_releases_attempt() {
        let ecu = MockEcu::can().response_delay(Duration::from_millis(300));
        let h = harness(ecu, None);

        let abandoned = tokio::time::timeout(Duration::from_millis(500), h.manager.connect()).await;
        assert!(abandoned.is_err());
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(!h.manager.cancel_connect());

        // let the spawned close run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.discovery.handles()[0].is_connected());

        assert_eq!(h.manager.connect().await.unwrap(), ConnectionState::Live);
        assert_eq!(h.discovery.handles().len(), 2);
        assert!(h.discovery.last_handle().unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_reconnect_closes_session() {
        let ecu = MockEcu::can().response_delay(Duration::from_millis(300));
        let h = harness(ecu, None);
        assert_eq!(h.manager.connect().await.unwrap(), ConnectionState::Live);

        let abandoned = tokio::time::timeout(Duration::from_millis(100), h.manager.reconnect()).await;
        assert!(abandoned.is_err());
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            h.manager.read_dtcs(DtcKind::Stored).await,
            Err(ConnectionError::NotConnected)
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.discovery.handles()[0].is_connected());
        assert_eq!(h.manager.connect().await.unwrap(), ConnectionState::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_leaves_manager_reusable() {
        let discovery = Arc::new(SimulatorDiscovery::new(MockEcu::can()).failing_scan("Bluetooth is off"));
        let manager = ConnectionManager::new(
            Settings::default(),
            discovery,
            Arc::new(MemoryStorage::new()),
            PidRegistry::with_standard_pids(),
        );

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Discovery(_)));
        assert!(!err.is_cancelled());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.connect().await,
            Err(ConnectionError::Discovery(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeping_ecu_runs_wake_ladder_then_reconnects() {
        let h = harness(MockEcu::can().offline(), None);
        assert_eq!(
            h.manager.connect().await.unwrap(),
            ConnectionState::AdapterOnly
        );

        let handle = h.discovery.last_handle().unwrap();
        let commands = handle.commands();
        let ladder: Vec<&String> = commands
            .iter()
            .filter(|c| matches!(c.as_str(), "ATSP3" | "ATSP4" | "ATSP6" | "ATSP7"))
            .collect();
        assert!(ladder.len() >= 4);
        assert_eq!(commands.last().map(String::as_str), Some("ATSP0"));
        assert!(handle.is_connected());
        assert!(matches!(
            h.manager.start_polling(),
            Err(ConnectionError::NotLive)
        ));

        handle.wake();
        assert_eq!(h.manager.reconnect().await.unwrap(), ConnectionState::Live);
        let fingerprint = h.manager.fingerprint().unwrap();
        assert_eq!(fingerprint.vin.as_deref(), Some("1FADP3F20EL123456"));
        assert_eq!(fingerprint.protocol, "ISO 15765-4 (CAN 11/500)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_adapter_stays_idle() {
        let discovery = Arc::new(SimulatorDiscovery::new(MockEcu::can()).with_label("Bluetooth Speaker"));
        let manager = ConnectionManager::new(
            Settings::default(),
            discovery.clone(),
            Arc::new(MemoryStorage::new()),
            PidRegistry::with_standard_pids(),
        );
        assert_eq!(manager.connect().await.unwrap(), ConnectionState::Idle);
        assert!(discovery.handles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_demotion_is_published() {
        let h = harness(MockEcu::can().no_data(0x11), None);
        let mut events = h.manager.subscribe();
        h.manager.connect().await.unwrap();
        h.manager.start_polling().unwrap();

        let demotion = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(ConnectionEvent::PidDemoted(d)) = events.recv().await {
                    return d;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(demotion.pid, "0111");
        assert_eq!(demotion.from, PollGroup::Fast);
        assert_eq!(demotion.to, PollGroup::Medium);
        h.manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_trouble_codes_through_manager() {
        let ecu = MockEcu::can().dtcs(DtcKind::Stored, &[0x0420, 0x0000]);
        let h = harness(ecu, None);
        assert!(matches!(
            h.manager.read_dtcs(DtcKind::Stored).await,
            Err(ConnectionError::NotConnected)
        ));

        h.manager.connect().await.unwrap();
        let codes = h.manager.read_dtcs(DtcKind::Stored).await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0420");
        assert!(h.manager.clear_dtcs().await.unwrap());
        assert!(h.manager.read_dtcs(DtcKind::Stored).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_is_rejected() {
        let ecu = MockEcu::can().response_delay(Duration::from_millis(100));
        let h = harness(ecu, None);
        let manager = h.manager.clone();
        let first = tokio::spawn(async move { manager.connect().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            h.manager.connect().await,
            Err(ConnectionError::AlreadyConnecting)
        ));
        assert_eq!(first.await.unwrap().unwrap(), ConnectionState::Live);
    }
}
