//! Byte-stream transport seam
//!
//! A transport moves text to and from the adapter with no framing. The
//! engine above detects the `>` prompt and owns every timeout.

use crate::error::ObdError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

/// Bidirectional link to an ELM327-class adapter
#[async_trait]
pub trait Transport: Send {
    /// Human readable name (port path, device name)
    fn name(&self) -> &str;

    /// Open the link
    async fn connect(&mut self) -> Result<(), ObdError>;

    /// Write raw text; the caller appends the carriage return
    async fn write(&mut self, text: &str) -> Result<(), ObdError>;

    /// Whatever bytes are available right now, possibly nothing.
    ///
    /// Must return promptly; an empty string is a normal result.
    async fn read_chunk(&mut self) -> Result<String, ObdError>;

    /// Close the link. Safe to call when already closed.
    async fn disconnect(&mut self);

    /// Whether the link is currently open
    fn is_connected(&self) -> bool;
}

/// Serial (USB / RFCOMM) ELM327 adapter
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    read_window: Duration,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    /// Common ELM327 clone baud rate
    pub const DEFAULT_BAUD_RATE: u32 = 38400;

    /// Create a transport for `path`; nothing is opened until `connect`
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_window: Duration::from_millis(20),
            stream: None,
        }
    }

    /// How long a single `read_chunk` waits for bytes
    pub fn with_read_window(mut self, window: Duration) -> Self {
        self.read_window = window;
        self
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.path
    }

    async fn connect(&mut self) -> Result<(), ObdError> {
        if self.stream.is_some() {
            return Ok(());
        }
        info!(path = %self.path, baud = self.baud_rate, "Opening serial adapter");
        let stream = tokio_serial::new(&self.path, self.baud_rate).open_native_async()?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn write(&mut self, text: &str) -> Result<(), ObdError> {
        let stream = self.stream.as_mut().ok_or(ObdError::NotConnected)?;
        stream.write_all(text.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<String, ObdError> {
        let stream = self.stream.as_mut().ok_or(ObdError::NotConnected)?;
        let mut buf = [0u8; 256];
        match tokio::time::timeout(self.read_window, stream.read(&mut buf)).await {
            Ok(Ok(0)) => Err(ObdError::Transport("serial port closed".into())),
            Ok(Ok(n)) => Ok(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(String::new()),
        }
    }

    async fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(path = %self.path, "Serial adapter closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// A serial port that might host an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path (`/dev/ttyUSB0`, `COM3`)
    pub name: String,
    /// USB product string, when known
    pub product: Option<String>,
    /// USB manufacturer string, when known
    pub manufacturer: Option<String>,
}

impl PortInfo {
    /// Text used when matching adapter name patterns
    pub fn label(&self) -> String {
        [Some(self.name.as_str()), self.product.as_deref(), self.manufacturer.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Enumerate serial ports visible to the OS
pub fn list_serial_ports() -> Result<Vec<PortInfo>, ObdError> {
    let mut ports: Vec<PortInfo> = tokio_serial::available_ports()?
        .into_iter()
        .map(|info| {
            let (product, manufacturer) = match info.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => (usb.product, usb.manufacturer),
                _ => (None, None),
            };
            PortInfo {
                name: info.port_name,
                product,
                manufacturer,
            }
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(ports)
}
