//! Scripted ELM327 simulator
//!
//! [`MockElm327`] implements [`Transport`] on top of a simulated adapter and
//! ECU. It answers the AT and OBD requests the engine issues, with the same
//! quirks a real clone shows: `SEARCHING...` on first auto-detect,
//! `BUS INIT` while a K-line ECU boots, `STOPPED` interruptions, ISO-TP
//! multi-frame output with and without headers, and chunked delivery that
//! ignores line boundaries.

use crate::error::ObdError;
use crate::protocol::ObdProtocol;
use crate::response::{self, DtcKind};
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Simulated vehicle behind the adapter
#[derive(Debug, Clone)]
pub struct MockEcu {
    /// Protocol the vehicle actually speaks
    pub protocol: ObdProtocol,
    /// VIN returned for `0902`
    pub vin: Option<String>,
    /// Only answer `0902` with headers on
    pub vin_requires_headers: bool,
    /// Calibration IDs returned for `0904`
    pub calibration_ids: Vec<String>,
    /// Mode 01 data bytes per PID; every key is advertised as supported
    pub values: BTreeMap<u8, Vec<u8>>,
    /// Advertised as supported, but always answers `NO DATA`
    pub no_data: BTreeSet<u8>,
    /// OBD requests on a compatible protocol that go unanswered before the
    /// ECU wakes up (`u32::MAX`: never)
    pub wake_after: u32,
    /// `BUS INIT: ...` replies before the first K-line answer
    pub busy_replies: u32,
    /// Commands answered with `STOPPED` the first time they are sent
    pub stopped_once: BTreeSet<String>,
    /// Stored, pending and permanent trouble codes as raw 16-bit words
    pub dtcs: HashMap<DtcKind, Vec<u16>>,
    /// Latency between a request and the first reply byte
    pub response_delay: Duration,
    /// Characters delivered per `read_chunk`
    pub chunk_size: usize,
    /// The adapter itself never answers
    pub silent: bool,
    /// Opening the link fails
    pub fail_connect: bool,
}

impl MockEcu {
    /// A warm, idling 11-bit CAN vehicle
    pub fn can() -> Self {
        Self::with_protocol(ObdProtocol::Iso15765_4Can11bit500)
    }

    /// A warm, idling ISO 9141-2 vehicle
    pub fn iso9141() -> Self {
        Self::with_protocol(ObdProtocol::Iso9141_2)
    }

    /// A warm, idling vehicle on `protocol`
    pub fn with_protocol(protocol: ObdProtocol) -> Self {
        let values = [
            (0x04, vec![0x40]),
            (0x05, vec![0x7B]),
            (0x0B, vec![0x21]),
            (0x0C, vec![0x0C, 0x80]),
            (0x0D, vec![0x00]),
            (0x0E, vec![0x8A]),
            (0x0F, vec![0x46]),
            (0x10, vec![0x01, 0x90]),
            (0x11, vec![0x24]),
            (0x1F, vec![0x00, 0x3C]),
            (0x2F, vec![0xA0]),
            (0x33, vec![0x65]),
            (0x42, vec![0x36, 0xB0]),
        ]
        .into_iter()
        .collect();

        Self {
            protocol,
            vin: Some("1FADP3F20EL123456".into()),
            vin_requires_headers: false,
            calibration_ids: Vec::new(),
            values,
            no_data: BTreeSet::new(),
            wake_after: 0,
            busy_replies: 0,
            stopped_once: BTreeSet::new(),
            dtcs: HashMap::new(),
            response_delay: Duration::ZERO,
            chunk_size: 8,
            silent: false,
            fail_connect: false,
        }
    }

    /// Replace the VIN (`None`: ECU does not report one)
    pub fn vin(mut self, vin: Option<&str>) -> Self {
        self.vin = vin.map(str::to_string);
        self
    }

    /// Set the data bytes for a Mode 01 PID
    pub fn value(mut self, pid: u8, bytes: &[u8]) -> Self {
        self.values.insert(pid, bytes.to_vec());
        self
    }

    /// Advertise `pid` but never answer it
    pub fn no_data(mut self, pid: u8) -> Self {
        self.no_data.insert(pid);
        self
    }

    /// Stay asleep for the first `probes` requests
    pub fn asleep_for(mut self, probes: u32) -> Self {
        self.wake_after = probes;
        self
    }

    /// Never wake up
    pub fn offline(self) -> Self {
        self.asleep_for(u32::MAX)
    }

    /// Answer with `BUS INIT: ...` this many times first
    pub fn busy_for(mut self, replies: u32) -> Self {
        self.busy_replies = replies;
        self
    }

    /// Interrupt the first `command` with `STOPPED`
    pub fn stopped_once(mut self, command: &str) -> Self {
        self.stopped_once.insert(command.to_ascii_uppercase());
        self
    }

    /// Set trouble codes of one kind
    pub fn dtcs(mut self, kind: DtcKind, words: &[u16]) -> Self {
        self.dtcs.insert(kind, words.to_vec());
        self
    }

    /// Add a calibration ID
    pub fn calibration_id(mut self, calid: &str) -> Self {
        self.calibration_ids.push(calid.to_string());
        self
    }

    /// Delay every reply
    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Only answer the VIN request with headers on
    pub fn vin_requires_headers(mut self) -> Self {
        self.vin_requires_headers = true;
        self
    }

    /// The adapter never replies at all
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Opening the link fails
    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    fn supported(&self) -> BTreeSet<u8> {
        self.values.keys().chain(self.no_data.iter()).copied().collect()
    }
}

impl Default for MockEcu {
    fn default() -> Self {
        Self::can()
    }
}

#[derive(Debug)]
struct MockState {
    ecu: MockEcu,
    connected: bool,
    connects: u32,
    disconnects: u32,
    selected: ObdProtocol,
    resolved: bool,
    headers: bool,
    probes: u32,
    input: String,
    output: String,
    ready_at: Instant,
    commands: Vec<String>,
}

impl MockState {
    fn reset_adapter(&mut self) {
        self.selected = ObdProtocol::Auto;
        self.resolved = false;
        self.headers = false;
    }

    fn compatible(&self) -> bool {
        self.selected == ObdProtocol::Auto || self.selected == self.ecu.protocol
    }

    fn awake(&self) -> bool {
        self.probes >= self.ecu.wake_after
    }

    fn handle(&mut self, command: &str) -> String {
        let cmd = response::clean(command);
        self.commands.push(cmd.clone());

        if self.ecu.stopped_once.remove(&cmd) {
            return "STOPPED".into();
        }
        if let Some(at) = cmd.strip_prefix("AT") {
            return self.handle_at(at);
        }
        self.handle_obd(&cmd)
    }

    fn handle_at(&mut self, at: &str) -> String {
        match at {
            "Z" => {
                self.reset_adapter();
                "\r\rELM327 v1.5".into()
            }
            "I" => "ELM327 v1.5".into(),
            "RV" => "12.6V".into(),
            "H0" => {
                self.headers = false;
                "OK".into()
            }
            "H1" => {
                self.headers = true;
                "OK".into()
            }
            "DP" => {
                if self.selected != ObdProtocol::Auto {
                    self.selected.description().into()
                } else if self.resolved {
                    format!("AUTO, {}", self.ecu.protocol.description())
                } else {
                    "AUTO".into()
                }
            }
            "SI" => {
                if self.selected.is_kline() && self.compatible() && self.awake() {
                    "BUS INIT: ...OK".into()
                } else {
                    "BUS INIT: ...ERROR".into()
                }
            }
            _ if at.starts_with("SP") => {
                let code = at.trim_start_matches("SP").trim_start_matches('A');
                match code.chars().next().and_then(ObdProtocol::from_code) {
                    Some(protocol) => {
                        self.selected = protocol;
                        self.resolved = false;
                        "OK".into()
                    }
                    None => "?".into(),
                }
            }
            "E0" | "E1" | "L0" | "L1" | "S0" | "S1" | "AT0" | "AT1" | "AT2" | "D" | "PC" => {
                "OK".into()
            }
            _ if at.starts_with("ST") || at.starts_with("SH") || at.starts_with("CRA") => {
                "OK".into()
            }
            _ => "?".into(),
        }
    }

    fn handle_obd(&mut self, cmd: &str) -> String {
        let bytes = response::hex_bytes(cmd);
        if bytes.is_empty() || bytes.len() * 2 != cmd.len() {
            return "?".into();
        }
        if !self.compatible() {
            return if self.selected.is_can() {
                "CAN ERROR".into()
            } else if self.selected.is_kline() {
                "BUS INIT: ...ERROR".into()
            } else {
                "UNABLE TO CONNECT".into()
            };
        }
        if !self.awake() {
            self.probes = self.probes.saturating_add(1);
            return if self.selected == ObdProtocol::Auto {
                "SEARCHING...\rUNABLE TO CONNECT".into()
            } else if self.selected.is_kline() {
                "BUS INIT: ...ERROR".into()
            } else {
                "NO DATA".into()
            };
        }
        if self.ecu.protocol.is_kline() && self.ecu.busy_replies > 0 {
            self.ecu.busy_replies -= 1;
            return "BUS INIT: ...".into();
        }

        let searching = self.selected == ObdProtocol::Auto && !self.resolved;
        self.resolved = true;
        let reply = self.obd_reply(&bytes);
        if searching {
            format!("SEARCHING...\r{reply}")
        } else {
            reply
        }
    }

    fn obd_reply(&mut self, request: &[u8]) -> String {
        match (request[0], request.get(1).copied()) {
            (0x01, Some(pid)) if pid % 0x20 == 0 => self.bitmap_reply(pid),
            (0x01, Some(pid)) => match self.ecu.values.get(&pid) {
                Some(data) if !self.ecu.no_data.contains(&pid) => {
                    let mut payload = vec![0x41, pid];
                    payload.extend(data);
                    self.frame(&payload)
                }
                _ => "NO DATA".into(),
            },
            (0x03, None) => self.dtc_reply(DtcKind::Stored),
            (0x07, None) => self.dtc_reply(DtcKind::Pending),
            (0x0A, None) => self.dtc_reply(DtcKind::Permanent),
            (0x04, None) => {
                self.ecu.dtcs.remove(&DtcKind::Stored);
                self.ecu.dtcs.remove(&DtcKind::Pending);
                self.frame(&[0x44])
            }
            (0x09, Some(0x02)) => match self.ecu.vin.clone() {
                Some(_) if self.ecu.vin_requires_headers && !self.headers => "NO DATA".into(),
                Some(vin) => self.vehicle_info(0x02, &[vin.into_bytes()]),
                None => "NO DATA".into(),
            },
            (0x09, Some(0x04)) if !self.ecu.calibration_ids.is_empty() => {
                let items: Vec<Vec<u8>> = self
                    .ecu
                    .calibration_ids
                    .iter()
                    .map(|calid| {
                        let mut bytes = calid.as_bytes().to_vec();
                        bytes.resize(16, 0);
                        bytes
                    })
                    .collect();
                self.vehicle_info(0x04, &items)
            }
            _ => "NO DATA".into(),
        }
    }

    fn bitmap_reply(&self, origin: u8) -> String {
        let supported = self.ecu.supported();
        let base = origin as u16;
        let mut mask = 0u32;
        for pid in supported.iter().map(|p| *p as u16) {
            if pid > base && pid <= base + 32 {
                mask |= 1 << (31 - (pid - base - 1));
            }
        }
        if supported.iter().any(|p| *p as u16 > base + 32) {
            mask |= 1;
        }
        if origin > 0 && mask == 0 {
            return "NO DATA".into();
        }
        let mut payload = vec![0x41, origin];
        payload.extend(mask.to_be_bytes());
        self.frame(&payload)
    }

    fn dtc_reply(&self, kind: DtcKind) -> String {
        let words = self.ecu.dtcs.get(&kind).cloned().unwrap_or_default();
        let sid = kind.response_sid();
        if self.ecu.protocol.is_can() {
            let mut payload = vec![sid, words.len() as u8];
            payload.extend(words.iter().flat_map(|w| w.to_be_bytes()));
            return self.can_frames(&payload);
        }
        let mut frames = Vec::new();
        let mut chunks: Vec<&[u16]> = words.chunks(3).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let mut payload = vec![sid];
            for i in 0..3 {
                payload.extend(chunk.get(i).copied().unwrap_or(0).to_be_bytes());
            }
            frames.push(self.frame(&payload));
        }
        frames.join("\r")
    }

    fn vehicle_info(&self, pid: u8, items: &[Vec<u8>]) -> String {
        if self.ecu.protocol.is_can() {
            let mut payload = vec![0x49, pid, items.len() as u8];
            payload.extend(items.iter().flatten());
            return self.can_frames(&payload);
        }
        // K-line: one frame per 4 data bytes, numbered from 1
        let data: Vec<u8> = items.iter().flatten().copied().collect();
        let mut padded = vec![0u8; (4 - data.len() % 4) % 4];
        padded.extend(data);
        padded
            .chunks(4)
            .enumerate()
            .map(|(i, chunk)| {
                let mut line = format!("49{pid:02X}{:02X}", i + 1);
                line.push_str(&hex(chunk));
                line
            })
            .collect::<Vec<_>>()
            .join("\r")
    }

    /// One reply frame in the current header mode
    fn frame(&self, payload: &[u8]) -> String {
        if !self.headers {
            return hex(payload);
        }
        if self.ecu.protocol.is_can() {
            format!("7E8{:02X}{}", payload.len(), hex(payload))
        } else {
            let mut framed = vec![0x48, 0x6B, 0x10];
            framed.extend(payload);
            let checksum = framed.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            framed.push(checksum);
            hex(&framed)
        }
    }

    /// ISO-TP segmentation as printed by the ELM327
    fn can_frames(&self, payload: &[u8]) -> String {
        if payload.len() <= 7 {
            return self.frame(payload);
        }
        let mut lines = Vec::new();
        let (first, rest) = payload.split_at(6);
        if self.headers {
            lines.push(format!("7E810{:02X}{}", payload.len(), hex(first)));
        } else {
            lines.push(format!("{:03X}", payload.len()));
            lines.push(format!("0:{}", hex(first)));
        }
        for (i, chunk) in rest.chunks(7).enumerate() {
            let mut bytes = chunk.to_vec();
            bytes.resize(7, 0);
            let index = (i + 1) % 16;
            if self.headers {
                lines.push(format!("7E82{index:X}{}", hex(&bytes)));
            } else {
                lines.push(format!("{index:X}:{}", hex(&bytes)));
            }
        }
        lines.join("\r")
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Simulated ELM327 adapter
pub struct MockElm327 {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockElm327 {
    /// Adapter in front of `ecu`
    pub fn new(ecu: MockEcu) -> Self {
        Self {
            name: "OBDII Simulator".into(),
            state: Arc::new(Mutex::new(MockState {
                ecu,
                connected: false,
                connects: 0,
                disconnects: 0,
                selected: ObdProtocol::Auto,
                resolved: false,
                headers: false,
                probes: 0,
                input: String::new(),
                output: String::new(),
                ready_at: Instant::now(),
                commands: Vec::new(),
            })),
        }
    }

    /// Rename the adapter (used by discovery tests)
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Inspection handle that stays valid after the transport is boxed
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Transport for MockElm327 {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), ObdError> {
        let mut state = self.state.lock();
        if state.ecu.fail_connect {
            return Err(ObdError::Transport("simulated connect failure".into()));
        }
        state.connected = true;
        state.connects += 1;
        state.input.clear();
        state.output.clear();
        state.reset_adapter();
        Ok(())
    }

    async fn write(&mut self, text: &str) -> Result<(), ObdError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(ObdError::NotConnected);
        }
        state.input.push_str(text);
        while let Some(end) = state.input.find('\r') {
            let command: String = state.input.drain(..=end).collect();
            if response::clean(&command).is_empty() || state.ecu.silent {
                continue;
            }
            let reply = state.handle(&command);
            state.output = format!("{reply}\r\r>");
            state.ready_at = Instant::now() + state.ecu.response_delay;
        }
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<String, ObdError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(ObdError::NotConnected);
        }
        if state.output.is_empty() || Instant::now() < state.ready_at {
            return Ok(String::new());
        }
        let take = state
            .output
            .char_indices()
            .nth(state.ecu.chunk_size.max(1))
            .map(|(idx, _)| idx)
            .unwrap_or(state.output.len());
        Ok(state.output.drain(..take).collect())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock();
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
            state.output.clear();
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Shared view into a [`MockElm327`] for assertions and live tweaks
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Every command received so far, cleaned
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// How often `command` was received
    pub fn count(&self, command: &str) -> usize {
        let command = response::clean(command);
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    /// Forget the command log
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Whether the link is open
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Number of successful `connect` calls
    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    /// Number of `disconnect` calls that closed an open link
    pub fn disconnects(&self) -> u32 {
        self.state.lock().disconnects
    }

    /// Change a PID value mid-run
    pub fn set_value(&self, pid: u8, bytes: &[u8]) {
        self.state.lock().ecu.values.insert(pid, bytes.to_vec());
    }

    /// Toggle whether an advertised PID answers
    pub fn set_no_data(&self, pid: u8, no_data: bool) {
        let mut state = self.state.lock();
        if no_data {
            state.ecu.no_data.insert(pid);
        } else {
            state.ecu.no_data.remove(&pid);
        }
    }

    /// Put the ECU back to sleep
    pub fn sleep(&self) {
        let mut state = self.state.lock();
        state.probes = 0;
        state.ecu.wake_after = u32::MAX;
    }

    /// Wake the ECU immediately
    pub fn wake(&self) {
        self.state.lock().ecu.wake_after = 0;
    }

    /// Current trouble codes of one kind
    pub fn dtcs(&self, kind: DtcKind) -> Vec<u16> {
        self.state.lock().ecu.dtcs.get(&kind).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::PidSupportBitmap;

    async fn exchange(mock: &mut MockElm327, cmd: &str) -> String {
        mock.write(&format!("{cmd}\r")).await.unwrap();
        let mut out = String::new();
        loop {
            let chunk = mock.read_chunk().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.push_str(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_auto_detect_and_bitmap() {
        let mut mock = MockElm327::new(MockEcu::can());
        mock.connect().await.unwrap();
        assert_eq!(exchange(&mut mock, "ATDP").await, "AUTO\r\r>");

        let reply = exchange(&mut mock, "0100").await;
        assert!(reply.starts_with("SEARCHING..."));
        let bitmap = PidSupportBitmap::parse(&reply, 0).unwrap();
        assert!(bitmap.supports(0x0C));
        assert!(bitmap.next_block_supported());

        let reply = exchange(&mut mock, "ATDP").await;
        assert!(reply.contains("AUTO, ISO 15765-4 (CAN 11/500)"));
    }

    #[tokio::test]
    async fn test_wrong_protocol_is_bus_error() {
        let mut mock = MockElm327::new(MockEcu::can());
        mock.connect().await.unwrap();
        exchange(&mut mock, "ATSP3").await;
        let reply = exchange(&mut mock, "0100").await;
        assert!(response::is_bus_error(&reply));
    }

    #[tokio::test]
    async fn test_vin_frames_parse() {
        let mut mock = MockElm327::new(MockEcu::can());
        mock.connect().await.unwrap();
        let reply = exchange(&mut mock, "0902").await;
        assert_eq!(response::parse_vin(&reply).as_deref(), Some("1FADP3F20EL123456"));

        exchange(&mut mock, "ATH1").await;
        let reply = exchange(&mut mock, "0902").await;
        assert_eq!(response::parse_vin(&reply).as_deref(), Some("1FADP3F20EL123456"));
    }

    #[tokio::test]
    async fn test_kline_vin_and_headers() {
        let mut mock = MockElm327::new(MockEcu::iso9141());
        mock.connect().await.unwrap();
        exchange(&mut mock, "ATSP3").await;
        let reply = exchange(&mut mock, "0902").await;
        assert_eq!(response::parse_vin(&reply).as_deref(), Some("1FADP3F20EL123456"));

        exchange(&mut mock, "ATH1").await;
        let reply = exchange(&mut mock, "0100").await;
        assert!(reply.starts_with("486B10"));
        assert!(PidSupportBitmap::parse(&reply, 0).is_some());
    }

    #[tokio::test]
    async fn test_silent_adapter() {
        let mut mock = MockElm327::new(MockEcu::can().silent());
        mock.connect().await.unwrap();
        assert_eq!(exchange(&mut mock, "ATZ").await, "");
    }

    #[tokio::test]
    async fn test_dtc_clear() {
        let mut mock = MockElm327::new(MockEcu::can().dtcs(DtcKind::Stored, &[0x0133]));
        let handle = mock.handle();
        mock.connect().await.unwrap();
        assert!(exchange(&mut mock, "03").await.starts_with("SEARCHING...\r43010133"));
        assert!(exchange(&mut mock, "04").await.starts_with("44"));
        assert!(handle.dtcs(DtcKind::Stored).is_empty());
        assert_eq!(handle.count("03"), 1);
    }
}
