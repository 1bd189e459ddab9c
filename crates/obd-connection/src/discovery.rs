//! Adapter discovery

use crate::ConnectionError;
use async_trait::async_trait;
use obd_protocol::mock::{MockEcu, MockElm327, MockHandle};
use obd_protocol::{list_serial_ports, SerialTransport, Transport};
use parking_lot::Mutex;
use tracing::{debug, info};

/// A discoverable adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Device path or address used to open it
    pub id: String,
    /// Human readable name (product, BLE name)
    pub label: String,
}

/// Source of adapters the manager can connect through
#[async_trait]
pub trait AdapterDiscovery: Send + Sync {
    /// Currently visible adapters
    async fn scan(&self) -> Result<Vec<AdapterInfo>, ConnectionError>;

    /// Open a transport to `adapter`; the transport is not yet connected
    async fn open(&self, adapter: &AdapterInfo) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// Pick an adapter: the preferred name first, then the first one whose id or
/// label contains a known pattern. Matching is case-insensitive.
pub fn select_adapter<'a>(
    adapters: &'a [AdapterInfo],
    preferred: Option<&str>,
    patterns: &[String],
) -> Option<&'a AdapterInfo> {
    let preferred = preferred
        .map(|name| name.trim().to_ascii_uppercase())
        .filter(|name| !name.is_empty());
    if let Some(wanted) = preferred {
        let found = adapters.iter().find(|adapter| {
            adapter.id.to_ascii_uppercase() == wanted
                || adapter.label.to_ascii_uppercase().contains(&wanted)
        });
        if found.is_some() {
            return found;
        }
        debug!(preferred = %wanted, "Preferred adapter not visible");
    }

    adapters.iter().find(|adapter| {
        let id = adapter.id.to_ascii_uppercase();
        let label = adapter.label.to_ascii_uppercase();
        patterns.iter().any(|pattern| {
            let pattern = pattern.to_ascii_uppercase();
            label.contains(&pattern) || id.contains(&pattern)
        })
    })
}

/// Serial ports (USB and Bluetooth SPP adapters)
#[derive(Debug, Clone)]
pub struct SerialDiscovery {
    baud_rate: u32,
}

impl SerialDiscovery {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialDiscovery {
    fn default() -> Self {
        Self::new(SerialTransport::DEFAULT_BAUD_RATE)
    }
}

#[async_trait]
impl AdapterDiscovery for SerialDiscovery {
    async fn scan(&self) -> Result<Vec<AdapterInfo>, ConnectionError> {
        let ports = list_serial_ports().map_err(|e| ConnectionError::Discovery(e.to_string()))?;
        debug!(count = ports.len(), "Serial ports enumerated");
        Ok(ports
            .into_iter()
            .map(|port| AdapterInfo {
                label: port.label(),
                id: port.name,
            })
            .collect())
    }

    async fn open(&self, adapter: &AdapterInfo) -> Result<Box<dyn Transport>, ConnectionError> {
        info!(port = %adapter.id, baud = self.baud_rate, "Opening serial adapter");
        Ok(Box::new(SerialTransport::new(adapter.id.clone(), self.baud_rate)))
    }
}

/// A simulated adapter in front of a scripted ECU
pub struct SimulatorDiscovery {
    ecu: MockEcu,
    label: String,
    scan_error: Option<String>,
    opened: Mutex<Vec<MockHandle>>,
}

impl SimulatorDiscovery {
    pub fn new(ecu: MockEcu) -> Self {
        Self {
            ecu,
            label: "OBDII Simulator".to_string(),
            scan_error: None,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    /// Make every scan fail, like a radio that is switched off
    pub fn failing_scan(mut self, reason: &str) -> Self {
        self.scan_error = Some(reason.to_string());
        self
    }

    /// Handles of every simulated adapter opened so far
    pub fn handles(&self) -> Vec<MockHandle> {
        self.opened.lock().clone()
    }

    /// Handle of the most recently opened adapter
    pub fn last_handle(&self) -> Option<MockHandle> {
        self.opened.lock().last().cloned()
    }
}

#[async_trait]
impl AdapterDiscovery for SimulatorDiscovery {
    async fn scan(&self) -> Result<Vec<AdapterInfo>, ConnectionError> {
        if let Some(reason) = &self.scan_error {
            return Err(ConnectionError::Discovery(reason.clone()));
        }
        Ok(vec![AdapterInfo {
            id: "sim:0".to_string(),
            label: self.label.clone(),
        }])
    }

    async fn open(&self, adapter: &AdapterInfo) -> Result<Box<dyn Transport>, ConnectionError> {
        let mock = MockElm327::new(self.ecu.clone()).named(&adapter.label);
        self.opened.lock().push(mock.handle());
        info!(adapter = %adapter.label, "Opening simulated adapter");
        Ok(Box::new(mock))
    }
}
