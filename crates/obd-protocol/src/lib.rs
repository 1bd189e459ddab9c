//! OBD-II Protocol Implementation
//!
//! This crate provides async communication with ELM327-compatible OBD-II
//! adapters over any byte-stream [`Transport`]. It supports ISO 15765-4
//! (CAN) and the K-line protocols (ISO 9141-2, ISO 14230-4 KWP).
//!
//! - [`ObdClient`]: command serialisation and the connect state machine
//! - [`PidRegistry`]: PID code to decoder factories
//! - [`CarData`]: the telemetry snapshot decoders write into
//! - [`mock::MockElm327`]: a scripted adapter for tests and simulation

mod client;
mod error;
mod fingerprint;
pub mod mock;
mod pid;
mod protocol;
mod registry;
pub mod response;
mod snapshot;
mod support;
mod transport;

pub use client::{
    ClientConfig, ConnectHints, ConnectOutcome, EnginePhase, ObdClient, ObdResponse,
};
pub use error::ObdError;
pub use fingerprint::{model_year_from_vin, EcuFingerprint};
pub use pid::{spec_for, PidDecoder, PidSpec, StandardDecoder, SupportBitmapDecoder, STANDARD_PIDS};
pub use protocol::{BusClass, ObdProtocol};
pub use registry::{DecoderFactory, PidRegistry};
pub use response::{Dtc, DtcKind};
pub use snapshot::CarData;
pub use support::{mode01_pid, PidSupportBitmap, SUPPORT_BLOCKS};
pub use transport::{list_serial_ports, PortInfo, SerialTransport, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
}
