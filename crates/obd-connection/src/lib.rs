//! Connection Orchestrator
//!
//! Finds an adapter, drives the protocol engine through connect and wake,
//! checks the vehicle against its stored profile, keeps learned data up to
//! date, and runs the live polling loop with optional recording.

mod discovery;
mod error;
mod manager;
mod matching;
mod settings;

pub use discovery::{select_adapter, AdapterDiscovery, AdapterInfo, SerialDiscovery, SimulatorDiscovery};
pub use error::ConnectionError;
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use matching::{match_profile, merge_learned, ProfileMatch};
pub use settings::{ConnectionConfig, Settings};
