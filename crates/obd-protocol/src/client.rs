//! OBD-II Client for ELM327 Adapters
//!
//! [`ObdClient`] owns one [`Transport`] and serialises every command through
//! a single async lock: the link has no multiplexing, so interleaved
//! writes would corrupt response framing. On top of that it runs the
//! connect state machine (base init, protocol select, ECU wake, capability
//! discovery) and the VIN/CALID/DTC reads.

use crate::error::ObdError;
use crate::fingerprint::EcuFingerprint;
use crate::protocol::{BusClass, ObdProtocol};
use crate::response::{self, Dtc, DtcKind};
use crate::support::{mode01_pid, PidSupportBitmap, SUPPORT_BLOCKS};
use crate::transport::Transport;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine timing and retry tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for ordinary AT commands
    pub command_timeout_ms: u64,
    /// Timeout for `ATZ` (the adapter reboots)
    pub reset_timeout_ms: u64,
    /// Pause after each base-init command
    pub settle_delay_ms: u64,
    /// Mode 01 timeout on CAN buses
    pub can_pid_timeout_ms: u64,
    /// Mode 01 timeout on ISO 9141 / KWP buses
    pub iso_pid_timeout_ms: u64,
    /// `0100` probe timeout while the adapter auto-searches
    pub search_timeout_ms: u64,
    /// Wait after `ATSI` for a K-line ECU to finish slow init
    pub kline_init_wait_ms: u64,
    /// `ATST` value used on K-line candidates (units of 4 ms)
    pub kline_silence_timeout: u8,
    /// `0100` attempts while waking the ECU
    pub wake_attempts: u32,
    /// Base pause between wake attempts, multiplied by the attempt number
    pub wake_backoff_ms: u64,
    /// Timeout for Mode 09 reads; the headers-on retry doubles it
    pub vehicle_info_timeout_ms: u64,
    /// Sleep between empty transport reads
    pub read_poll_ms: u64,
    /// Delay before retrying a `STOPPED` reply
    pub stopped_retry_delay_ms: u64,
    /// Send `ATAT2` on CAN buses
    pub adaptive_timing: bool,
    /// Protocols tried in order after any hint
    pub protocol_candidates: Vec<ObdProtocol>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 1000,
            reset_timeout_ms: 2500,
            settle_delay_ms: 100,
            can_pid_timeout_ms: 400,
            iso_pid_timeout_ms: 1000,
            search_timeout_ms: 6000,
            kline_init_wait_ms: 3000,
            kline_silence_timeout: 0xFF,
            wake_attempts: 3,
            wake_backoff_ms: 500,
            vehicle_info_timeout_ms: 1500,
            read_poll_ms: 5,
            stopped_retry_delay_ms: 200,
            adaptive_timing: true,
            protocol_candidates: vec![
                ObdProtocol::Auto,
                ObdProtocol::Iso9141_2,
                ObdProtocol::Iso14230_4Kwp,
                ObdProtocol::Iso14230_4KwpFast,
                ObdProtocol::Iso15765_4Can11bit500,
                ObdProtocol::Iso15765_4Can29bit500,
            ],
        }
    }
}

/// Per-vehicle adjustments applied during connect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectHints {
    /// Protocol to try before the candidate list
    pub protocol: Option<ObdProtocol>,
    /// Extra AT commands sent after base init
    pub init_script: Vec<String>,
    /// CAN transmit header (`ATSH`)
    pub can_header: Option<String>,
    /// CAN receive filter (`ATCRA`)
    pub can_receive_filter: Option<String>,
}

/// Connect state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnginePhase {
    /// No open link
    Disconnected,
    /// Opening the transport
    TransportConnecting,
    /// Reset / echo / linefeed / spaces
    BaseInit,
    /// Searching for a bus protocol
    ProtocolSelect,
    /// Adapter is up; waiting for (or failed to get) an ECU answer
    EcuWake,
    /// Reading support bitmaps and identity
    CapabilityDiscovery,
    /// ECU awake and fingerprinted
    Ready,
}

/// One command and its raw, unparsed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObdResponse {
    /// Command as sent, without the carriage return
    pub command: String,
    /// Reply up to the prompt, echo removed, trimmed
    pub raw: String,
    /// Time from write to prompt (or deadline)
    pub elapsed: Duration,
    /// No prompt arrived before the deadline
    pub timed_out: bool,
}

impl ObdResponse {
    /// Nothing came back at all
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Empty, `NO DATA` or `?`
    pub fn is_no_data(&self) -> bool {
        response::is_no_data(&self.raw)
    }

    /// The adapter reported `STOPPED`
    pub fn is_stopped(&self) -> bool {
        response::clean(&self.raw).contains("STOPPED")
    }

    /// The selected protocol could not reach the bus
    pub fn is_bus_error(&self) -> bool {
        response::is_bus_error(&self.raw)
    }
}

/// Result of a connect, wake or re-probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// The ECU answered `0100`
    pub ecu_awake: bool,
    /// Active protocol description
    pub protocol: String,
    /// Bus family of that protocol
    pub bus: BusClass,
    /// Identity read after a successful wake
    pub fingerprint: Option<EcuFingerprint>,
}

#[derive(Debug)]
struct EngineState {
    phase: EnginePhase,
    protocol: String,
    bus: BusClass,
    ecu_awake: bool,
    support: BTreeMap<u8, PidSupportBitmap>,
    fingerprint: Option<EcuFingerprint>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            phase: EnginePhase::Disconnected,
            protocol: String::new(),
            bus: BusClass::Unknown,
            ecu_awake: false,
            support: BTreeMap::new(),
            fingerprint: None,
        }
    }
}

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    name: String,
    io: Mutex<Box<dyn Transport>>,
    config: ClientConfig,
    state: RwLock<EngineState>,
}

impl ObdClient {
    /// Wrap a transport; nothing is sent until [`ObdClient::connect`]
    pub fn new(transport: Box<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            name: transport.name().to_string(),
            io: Mutex::new(transport),
            config,
            state: RwLock::new(EngineState::default()),
        }
    }

    /// Transport name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current state machine position
    pub fn phase(&self) -> EnginePhase {
        self.state.read().phase
    }

    /// Active protocol description (empty before protocol selection)
    pub fn protocol_description(&self) -> String {
        self.state.read().protocol.clone()
    }

    /// Bus family of the active protocol
    pub fn bus(&self) -> BusClass {
        self.state.read().bus
    }

    /// Whether the ECU answered the last wake attempt
    pub fn is_ecu_awake(&self) -> bool {
        self.state.read().ecu_awake
    }

    /// Fingerprint from the last successful wake
    pub fn fingerprint(&self) -> Option<EcuFingerprint> {
        self.state.read().fingerprint.clone()
    }

    /// Mode 01 timeout for the active bus
    pub fn pid_timeout(&self) -> Duration {
        let ms = match self.bus() {
            BusClass::Can => self.config.can_pid_timeout_ms,
            BusClass::IsoKwp | BusClass::Unknown => self.config.iso_pid_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Send one command and collect the reply up to the `>` prompt.
    ///
    /// Holds the I/O lock for the whole exchange. A `STOPPED` reply is
    /// retried exactly once when `retry_stopped` is set. An empty reply is a
    /// valid result, not an error.
    pub async fn send_command(
        &self,
        cmd: &str,
        timeout: Duration,
        retry_stopped: bool,
    ) -> Result<ObdResponse, ObdError> {
        let mut io = self.io.lock().await;
        let response = self.exchange(&mut **io, cmd, timeout).await?;
        if retry_stopped && response.is_stopped() {
            debug!(command = cmd, "Adapter reported STOPPED, retrying once");
            tokio::time::sleep(Duration::from_millis(self.config.stopped_retry_delay_ms)).await;
            return self.exchange(&mut **io, cmd, timeout).await;
        }
        Ok(response)
    }

    async fn exchange(
        &self,
        transport: &mut dyn Transport,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ObdResponse, ObdError> {
        if !transport.is_connected() {
            return Err(ObdError::NotConnected);
        }
        let started = Instant::now();
        let deadline = started + timeout;
        let poll = Duration::from_millis(self.config.read_poll_ms);
        transport.write(&format!("{cmd}\r")).await?;

        let mut buffer = String::new();
        let timed_out = loop {
            let chunk = transport.read_chunk().await?;
            if !chunk.is_empty() {
                buffer.push_str(&chunk);
                if buffer.contains('>') {
                    break false;
                }
            }
            if Instant::now() >= deadline {
                break true;
            }
            if chunk.is_empty() {
                tokio::time::sleep(poll).await;
            }
        };

        let body = buffer.split('>').next().unwrap_or_default();
        let raw = strip_echo(body, cmd);
        let elapsed = started.elapsed();
        if timed_out {
            debug!(command = cmd, raw = %raw, ?elapsed, "No prompt before deadline");
        }
        Ok(ObdResponse {
            command: cmd.to_string(),
            raw,
            elapsed,
            timed_out,
        })
    }

    /// Open the transport and run the full connect sequence.
    ///
    /// An ECU that never answers is not an error: the outcome reports
    /// `ecu_awake == false` with the adapter still connected. Any error,
    /// including cancellation, tears the transport down before returning.
    pub async fn connect(
        &self,
        hints: &ConnectHints,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome, ObdError> {
        match self.run_connect(hints, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(adapter = %self.name, error = %e, "Connect failed, tearing down");
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn run_connect(
        &self,
        hints: &ConnectHints,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome, ObdError> {
        *self.state.write() = EngineState::default();
        self.set_phase(EnginePhase::TransportConnecting);
        info!(adapter = %self.name, "Connecting to OBD adapter");
        cancellable(cancel, async {
            let mut io = self.io.lock().await;
            io.connect().await
        })
        .await?;

        self.set_phase(EnginePhase::BaseInit);
        self.base_init(cancel).await?;
        for cmd in &hints.init_script {
            let reply = self.command(cmd, self.command_timeout(), cancel).await?;
            debug!(command = %cmd, raw = %reply.raw, "Init script command");
        }

        self.set_phase(EnginePhase::ProtocolSelect);
        let (protocol, bus) = self.select_protocol(hints.protocol, cancel).await?;
        {
            let mut state = self.state.write();
            state.protocol = protocol.clone();
            state.bus = bus;
        }
        info!(protocol = %protocol, ?bus, "Protocol selected");
        self.apply_bus_settings(hints, bus, cancel).await?;

        self.set_phase(EnginePhase::EcuWake);
        if !self.wake_ecu(cancel).await? {
            warn!(adapter = %self.name, "ECU did not answer; adapter connected, ECU offline");
            return Ok(self.outcome());
        }
        self.discover(cancel).await?;
        Ok(self.outcome())
    }

    async fn base_init(&self, cancel: &CancellationToken) -> Result<(), ObdError> {
        let settle = Duration::from_millis(self.config.settle_delay_ms);
        let mut answered = false;
        for cmd in ["ATZ", "ATE0", "ATL0", "ATS0"] {
            let timeout = if cmd == "ATZ" {
                Duration::from_millis(self.config.reset_timeout_ms)
            } else {
                self.command_timeout()
            };
            let reply = self.command(cmd, timeout, cancel).await?;
            if reply.is_empty() {
                warn!(command = cmd, "No reply during base init");
            } else {
                debug!(command = cmd, raw = %reply.raw, "Base init");
                answered = true;
            }
            pause(cancel, settle).await?;
        }
        if !answered {
            return Err(ObdError::HandshakeFailed(format!(
                "{} did not answer ATZ/ATE0/ATL0/ATS0",
                self.name
            )));
        }
        Ok(())
    }

    async fn select_protocol(
        &self,
        hint: Option<ObdProtocol>,
        cancel: &CancellationToken,
    ) -> Result<(String, BusClass), ObdError> {
        let mut candidates: Vec<ObdProtocol> = hint.into_iter().collect();
        for candidate in &self.config.protocol_candidates {
            if !candidates.contains(candidate) {
                candidates.push(*candidate);
            }
        }

        for candidate in candidates {
            if let Some(found) = self.try_candidate(candidate, cancel).await? {
                return Ok(found);
            }
        }

        let fallback = ObdProtocol::Iso9141_2;
        warn!("No protocol candidate answered, forcing {}", fallback.description());
        self.command(fallback.to_elm_command(), self.command_timeout(), cancel)
            .await?;
        Ok((fallback.description().to_string(), BusClass::IsoKwp))
    }

    async fn try_candidate(
        &self,
        protocol: ObdProtocol,
        cancel: &CancellationToken,
    ) -> Result<Option<(String, BusClass)>, ObdError> {
        debug!(protocol = protocol.description(), "Trying protocol candidate");
        self.command(protocol.to_elm_command(), self.command_timeout(), cancel)
            .await?;
        if protocol.is_kline() {
            self.kline_slow_init(cancel).await?;
        }

        let probe = self
            .command("0100", self.probe_timeout(protocol), cancel)
            .await;
        if protocol.is_kline() {
            self.command("ATH0", self.command_timeout(), cancel).await?;
        }
        let probe = probe?;
        if probe.is_empty() || probe.is_bus_error() {
            debug!(
                protocol = protocol.description(),
                raw = %probe.raw,
                "Candidate rejected"
            );
            return Ok(None);
        }

        let described = self.describe_protocol(cancel).await?;
        Ok(described.filter(|(_, bus)| *bus != BusClass::Unknown))
    }

    /// `ATDP`, classified. `None` when the adapter gave nothing usable.
    async fn describe_protocol(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(String, BusClass)>, ObdError> {
        let reply = self.command("ATDP", self.command_timeout(), cancel).await?;
        let description = reply
            .raw
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or_default()
            .trim_start_matches("AUTO, ")
            .to_string();
        let bus = BusClass::from_description(&description);
        if description.is_empty() || bus == BusClass::Unknown {
            return Ok(None);
        }
        Ok(Some((description, bus)))
    }

    async fn kline_slow_init(&self, cancel: &CancellationToken) -> Result<(), ObdError> {
        self.command("ATH1", self.command_timeout(), cancel).await?;
        let silence = format!("ATST{:02X}", self.config.kline_silence_timeout);
        self.command(&silence, self.command_timeout(), cancel).await?;
        let reply = self
            .command("ATSI", Duration::from_millis(self.config.kline_init_wait_ms), cancel)
            .await?;
        debug!(raw = %reply.raw, "K-line slow init");
        pause(cancel, Duration::from_millis(self.config.kline_init_wait_ms)).await
    }

    async fn apply_bus_settings(
        &self,
        hints: &ConnectHints,
        bus: BusClass,
        cancel: &CancellationToken,
    ) -> Result<(), ObdError> {
        if bus.is_can() {
            if self.config.adaptive_timing {
                self.command("ATAT2", self.command_timeout(), cancel).await?;
            }
            if let Some(header) = &hints.can_header {
                self.command(&format!("ATSH{header}"), self.command_timeout(), cancel)
                    .await?;
            }
            if let Some(filter) = &hints.can_receive_filter {
                self.command(&format!("ATCRA{filter}"), self.command_timeout(), cancel)
                    .await?;
            }
        }
        Ok(())
    }

    /// Probe `0100` with headers on until a support bitmap comes back
    async fn wake_ecu(&self, cancel: &CancellationToken) -> Result<bool, ObdError> {
        self.command("ATH1", self.command_timeout(), cancel).await?;
        let base = self.pid_timeout();
        let mut bitmap = None;

        for attempt in 1..=self.config.wake_attempts {
            let reply = self.command("0100", base * (attempt + 1), cancel).await?;
            if let Some(parsed) = PidSupportBitmap::parse(&reply.raw, 0x00) {
                bitmap = Some(parsed);
                break;
            }
            if response::is_busy(&reply.raw) {
                info!(attempt, raw = %reply.raw, "ECU still initialising");
            } else {
                warn!(attempt, raw = %reply.raw, "Unexpected wake reply");
            }
            let backoff = Duration::from_millis(self.config.wake_backoff_ms) * attempt;
            pause(cancel, backoff).await?;
        }

        self.command("ATH0", self.command_timeout(), cancel).await?;
        let awake = bitmap.is_some();
        let mut state = self.state.write();
        state.ecu_awake = awake;
        if let Some(bitmap) = bitmap {
            state.support.insert(0x00, bitmap);
        }
        Ok(awake)
    }

    /// Remaining support blocks, then VIN and CALIDs
    async fn discover(&self, cancel: &CancellationToken) -> Result<(), ObdError> {
        self.set_phase(EnginePhase::CapabilityDiscovery);
        let timeout = self.pid_timeout();

        for window in SUPPORT_BLOCKS.windows(2) {
            let (previous, origin) = (window[0], window[1]);
            let advertised = self
                .state
                .read()
                .support
                .get(&previous)
                .map(|bitmap| bitmap.next_block_supported());
            if advertised == Some(false) {
                break;
            }
            let reply = self
                .command(&format!("01{origin:02X}"), timeout, cancel)
                .await?;
            match PidSupportBitmap::parse(&reply.raw, origin) {
                Some(bitmap) => {
                    self.state.write().support.insert(origin, bitmap);
                }
                None => debug!(origin, raw = %reply.raw, "Support block unavailable"),
            }
        }

        let vin = self.read_vin(cancel).await?;
        let calibration_ids = self.read_calibration_ids(cancel).await?;
        let fingerprint = EcuFingerprint::new(
            vin,
            self.protocol_description(),
            self.supported_pids(),
            calibration_ids,
        );
        info!(
            vin = fingerprint.vin.as_deref().unwrap_or("-"),
            protocol = %fingerprint.protocol,
            supported = fingerprint.supported_pids.len(),
            "ECU fingerprinted"
        );

        let mut state = self.state.write();
        state.fingerprint = Some(fingerprint);
        state.phase = EnginePhase::Ready;
        Ok(())
    }

    /// Mode 09 PID 02, retried once with headers on
    pub async fn read_vin(&self, cancel: &CancellationToken) -> Result<Option<String>, ObdError> {
        let timeout = Duration::from_millis(self.config.vehicle_info_timeout_ms);
        let reply = self.command("0902", timeout, cancel).await?;
        if let Some(vin) = response::parse_vin(&reply.raw) {
            return Ok(Some(vin));
        }

        debug!(raw = %reply.raw, "VIN not found with headers off, retrying with headers on");
        self.command("ATH1", self.command_timeout(), cancel).await?;
        let retry = self.command("0902", timeout * 2, cancel).await;
        self.command("ATH0", self.command_timeout(), cancel).await?;
        let vin = response::parse_vin(&retry?.raw);
        if vin.is_none() {
            info!("ECU did not report a VIN");
        }
        Ok(vin)
    }

    /// Mode 09 PID 04
    pub async fn read_calibration_ids(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ObdError> {
        let timeout = Duration::from_millis(self.config.vehicle_info_timeout_ms);
        let reply = self.command("0904", timeout, cancel).await?;
        Ok(response::parse_calibration_ids(&reply.raw))
    }

    /// Read one list of trouble codes
    pub async fn read_dtcs(&self, kind: DtcKind) -> Result<Vec<Dtc>, ObdError> {
        let reply = self
            .send_command(&kind.command(), self.pid_timeout() * 2, true)
            .await?;
        let codes = response::parse_dtcs(&reply.raw, kind, self.bus());
        info!(?kind, count = codes.len(), "Trouble codes read");
        Ok(codes)
    }

    /// Mode 04. Success means the reply carried no error or garbage.
    pub async fn clear_dtcs(&self) -> Result<bool, ObdError> {
        let reply = self
            .send_command("04", self.pid_timeout() * 2, true)
            .await?;
        let cleared = !reply.timed_out && !response::is_error_reply(&reply.raw);
        if cleared {
            info!("Trouble codes cleared");
        } else {
            warn!(raw = %reply.raw, "Clear trouble codes was not acknowledged");
        }
        Ok(cleared)
    }

    /// Query one Mode 01 PID with the bus timeout
    pub async fn query_pid(&self, pid: &str) -> Result<ObdResponse, ObdError> {
        self.send_command(pid, self.pid_timeout(), true).await
    }

    /// Force `protocol` and probe `0100` up to `probes` times.
    ///
    /// Used by the wake ladder after a connect left the ECU asleep; on
    /// success the capability discovery runs as in a full connect.
    pub async fn try_protocol(
        &self,
        protocol: ObdProtocol,
        probes: u32,
        cancel: &CancellationToken,
    ) -> Result<ConnectOutcome, ObdError> {
        self.command(protocol.to_elm_command(), self.command_timeout(), cancel)
            .await?;
        if protocol.is_kline() {
            self.kline_slow_init(cancel).await?;
        } else {
            self.command("ATH1", self.command_timeout(), cancel).await?;
        }

        let timeout = self.probe_timeout(protocol);
        let mut bitmap = None;
        for probe in 1..=probes {
            let reply = self.command("0100", timeout, cancel).await?;
            bitmap = PidSupportBitmap::parse(&reply.raw, 0x00);
            if bitmap.is_some() {
                break;
            }
            debug!(
                protocol = protocol.description(),
                probe,
                raw = %reply.raw,
                "Wake probe unanswered"
            );
        }
        self.command("ATH0", self.command_timeout(), cancel).await?;

        let Some(bitmap) = bitmap else {
            return Ok(self.outcome());
        };
        let (description, bus) = match self.describe_protocol(cancel).await? {
            Some(found) => found,
            None => (protocol.description().to_string(), protocol.bus_class()),
        };
        {
            let mut state = self.state.write();
            state.protocol = description;
            state.bus = bus;
            state.ecu_awake = true;
            state.support.clear();
            state.support.insert(0x00, bitmap);
        }
        info!(protocol = protocol.description(), "ECU woke up");
        self.discover(cancel).await?;
        Ok(self.outcome())
    }

    /// Lightweight reconnection: re-probe `0100` on the current protocol
    /// and, if the ECU answers, fingerprint again.
    pub async fn reprobe(&self, cancel: &CancellationToken) -> Result<ConnectOutcome, ObdError> {
        if self.phase() == EnginePhase::Disconnected {
            return Err(ObdError::NotConnected);
        }
        self.state.write().support.clear();
        self.set_phase(EnginePhase::EcuWake);
        if self.wake_ecu(cancel).await? {
            // The bus may differ from the one selected while the ECU slept
            if let Some((description, bus)) = self.describe_protocol(cancel).await? {
                let mut state = self.state.write();
                state.protocol = description;
                state.bus = bus;
            }
            self.discover(cancel).await?;
        } else {
            self.state.write().fingerprint = None;
        }
        Ok(self.outcome())
    }

    /// Whether the cached bitmaps positively advertise `pid`
    pub fn supports_pid(&self, pid: &str) -> bool {
        let Some(pid) = mode01_pid(pid) else {
            return false;
        };
        if pid == 0 {
            return false;
        }
        let origin = (pid - 1) / 0x20 * 0x20;
        self.state
            .read()
            .support
            .get(&origin)
            .is_some_and(|bitmap| bitmap.supports(pid))
    }

    /// Every advertised Mode 01 data PID (support-block PIDs excluded)
    pub fn supported_pids(&self) -> Vec<String> {
        self.state
            .read()
            .support
            .values()
            .flat_map(|bitmap| bitmap.supported_pids().collect::<Vec<_>>())
            .filter(|pid| pid % 0x20 != 0)
            .map(|pid| format!("01{pid:02X}"))
            .collect()
    }

    /// Close the transport and forget everything learned
    pub async fn disconnect(&self) {
        let mut io = self.io.lock().await;
        io.disconnect().await;
        *self.state.write() = EngineState::default();
        info!(adapter = %self.name, "Disconnected");
    }

    async fn command(
        &self,
        cmd: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ObdResponse, ObdError> {
        cancellable(cancel, self.send_command(cmd, timeout, true)).await
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout_ms)
    }

    fn probe_timeout(&self, protocol: ObdProtocol) -> Duration {
        let ms = if protocol == ObdProtocol::Auto {
            self.config.search_timeout_ms
        } else if protocol.is_can() {
            self.config.can_pid_timeout_ms * 2
        } else {
            self.config.iso_pid_timeout_ms * 2
        };
        Duration::from_millis(ms)
    }

    fn set_phase(&self, phase: EnginePhase) {
        let mut state = self.state.write();
        if state.phase != phase {
            debug!(from = ?state.phase, to = ?phase, "Engine phase");
            state.phase = phase;
        }
    }

    fn outcome(&self) -> ConnectOutcome {
        let state = self.state.read();
        ConnectOutcome {
            ecu_awake: state.ecu_awake,
            protocol: state.protocol.clone(),
            bus: state.bus,
            fingerprint: state.fingerprint.clone(),
        }
    }
}

/// Drop the reply's leading echo line if the adapter still echoes
fn strip_echo(body: &str, cmd: &str) -> String {
    let trimmed = body.trim();
    let cmd_clean = response::clean(cmd);
    match trimmed.split_once(['\r', '\n']) {
        Some((first, rest)) if response::clean(first) == cmd_clean => rest.trim().to_string(),
        None if response::clean(trimmed) == cmd_clean && !cmd_clean.is_empty() => String::new(),
        _ => trimmed.to_string(),
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ObdError>
where
    F: Future<Output = Result<T, ObdError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ObdError::Cancelled),
        result = fut => result,
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<(), ObdError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ObdError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockEcu, MockElm327, MockHandle};

    fn client(ecu: MockEcu) -> (ObdClient, MockHandle) {
        let mock = MockElm327::new(ecu);
        let handle = mock.handle();
        (ObdClient::new(Box::new(mock), ClientConfig::default()), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_can_vehicle() {
        let (client, handle) = client(MockEcu::can().calibration_id("CAL12345"));
        let outcome = client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.ecu_awake);
        assert_eq!(outcome.bus, BusClass::Can);
        assert_eq!(outcome.protocol, "ISO 15765-4 (CAN 11/500)");
        assert_eq!(client.phase(), EnginePhase::Ready);

        let fingerprint = outcome.fingerprint.unwrap();
        assert_eq!(fingerprint.vin.as_deref(), Some("1FADP3F20EL123456"));
        assert_eq!(fingerprint.model_year, Some(2014));
        assert_eq!(fingerprint.calibration_ids, vec!["CAL12345".to_string()]);
        assert!(fingerprint.supports("010C"));
        assert!(fingerprint.supports("0142"));

        assert!(client.supports_pid("010C"));
        assert!(client.supports_pid("0142"));
        assert!(!client.supports_pid("0103"));
        assert!(!client.supports_pid("0100"));

        let commands = handle.commands();
        assert_eq!(&commands[..4], &["ATZ", "ATE0", "ATL0", "ATS0"]);
        assert!(commands.contains(&"ATAT2".to_string()));
        // auto-detect found the bus, so no explicit candidates were tried
        assert_eq!(handle.count("ATSP3"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_kline_vehicle() {
        let (client, handle) = client(MockEcu::iso9141().busy_for(1));
        let hints = ConnectHints {
            protocol: Some(ObdProtocol::Iso9141_2),
            ..Default::default()
        };
        let outcome = client.connect(&hints, &CancellationToken::new()).await.unwrap();

        assert!(outcome.ecu_awake);
        assert_eq!(outcome.bus, BusClass::IsoKwp);
        assert_eq!(outcome.protocol, "ISO 9141-2");
        assert_eq!(client.pid_timeout(), Duration::from_millis(1000));
        assert_eq!(handle.count("ATSI"), 1);
        assert_eq!(handle.count("ATSTFF"), 1);
        assert_eq!(handle.count("ATAT2"), 0);
        assert_eq!(handle.count("ATSP0"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_asleep_ecu_is_not_an_error() {
        let (client, handle) = client(MockEcu::can().offline());
        let outcome = client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.ecu_awake);
        assert!(outcome.fingerprint.is_none());
        assert_eq!(client.phase(), EnginePhase::EcuWake);
        assert!(handle.is_connected());
        assert!(client.supported_pids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidate_forces_iso_fallback() {
        // asleep ECU: auto search fails, so does every explicit K-line candidate;
        // restrict candidates so CAN is never tried
        let mock = MockElm327::new(MockEcu::can().offline());
        let handle = mock.handle();
        let config = ClientConfig {
            protocol_candidates: vec![ObdProtocol::Auto, ObdProtocol::Iso9141_2],
            ..Default::default()
        };
        let client = ObdClient::new(Box::new(mock), config);
        let outcome = client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.protocol, "ISO 9141-2");
        assert_eq!(outcome.bus, BusClass::IsoKwp);
        assert_eq!(handle.count("ATSP3"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_adapter_fails_handshake() {
        let (client, handle) = client(MockEcu::can().silent());
        let err = client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::HandshakeFailed(_)));
        assert!(!handle.is_connected());
        assert_eq!(client.phase(), EnginePhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_is_retried_once() {
        let (client, handle) = client(MockEcu::can().stopped_once("010C"));
        client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();

        let reply = client.query_pid("010C").await.unwrap();
        assert_eq!(reply.raw, "410C0C80");
        assert_eq!(handle.count("010C"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vin_retried_with_headers() {
        let (client, handle) = client(MockEcu::can().vin_requires_headers());
        let outcome = client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.fingerprint.and_then(|f| f.vin).as_deref(),
            Some("1FADP3F20EL123456")
        );
        assert_eq!(handle.count("0902"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_handshake_tears_down() {
        let (client, handle) =
            client(MockEcu::can().response_delay(Duration::from_millis(300)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = client
            .connect(&ConnectHints::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Cancelled));
        assert!(!handle.is_connected());
        assert_eq!(client.phase(), EnginePhase::Disconnected);

        // the lock was released and a fresh attempt runs to completion
        let outcome = client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.ecu_awake);
        assert_eq!(handle.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_protocol_wakes_ecu() {
        let (client, handle) = client(MockEcu::can().offline());
        client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!client.is_ecu_awake());

        handle.wake();
        let outcome = client
            .try_protocol(ObdProtocol::Iso15765_4Can11bit500, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.ecu_awake);
        assert_eq!(outcome.bus, BusClass::Can);
        assert!(outcome.fingerprint.is_some());
        assert_eq!(client.phase(), EnginePhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reprobe_after_ecu_sleeps() {
        let (client, handle) = client(MockEcu::can());
        client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();
        handle.sleep();
        let outcome = client.reprobe(&CancellationToken::new()).await.unwrap();
        assert!(!outcome.ecu_awake);
        assert!(outcome.fingerprint.is_none());

        handle.wake();
        let outcome = client.reprobe(&CancellationToken::new()).await.unwrap();
        assert!(outcome.ecu_awake);
        assert!(client.supports_pid("010D"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtc_read_and_clear() {
        let (client, _handle) = client(
            MockEcu::can()
                .dtcs(DtcKind::Stored, &[0x0133, 0x0420])
                .dtcs(DtcKind::Pending, &[0x0300]),
        );
        client
            .connect(&ConnectHints::default(), &CancellationToken::new())
            .await
            .unwrap();

        let stored: Vec<String> = client
            .read_dtcs(DtcKind::Stored)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.code)
            .collect();
        assert_eq!(stored, vec!["P0133", "P0420"]);

        assert!(client.clear_dtcs().await.unwrap());
        assert!(client.read_dtcs(DtcKind::Stored).await.unwrap().is_empty());
        assert!(client.read_dtcs(DtcKind::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let (client, _handle) = client(MockEcu::can());
        let err = client.query_pid("010C").await.unwrap_err();
        assert!(matches!(err, ObdError::NotConnected));
        assert!(matches!(
            client.reprobe(&CancellationToken::new()).await,
            Err(ObdError::NotConnected)
        ));
    }

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo("ATZ\r\rELM327 v1.5\r\r", "ATZ"), "ELM327 v1.5");
        assert_eq!(strip_echo("410C1AF8\r\r", "010C"), "410C1AF8");
        assert_eq!(strip_echo("  ", "010C"), "");
    }
}
