//! Byte-level transport to the adapter.
//!
//! `Transport` knows nothing about OBD-II: it writes bytes, reads whatever
//! bytes arrive within a timeout, and can discard unread input. Two impls:
//! - `SerialTransport` wraps a `tokio-serial` stream (USB, Bluetooth rfcomm)
//! - `MockTransport` replays scripted adapter replies (in `mock.rs`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, warn};

use crate::error::{ObdError, ObdResult};

/// Default ELM327 serial speed
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Trait for byte channels to an OBD-II adapter.
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes to the adapter.
    async fn write(&mut self, bytes: &[u8]) -> ObdResult<()>;

    /// Read the bytes that arrive within `timeout`.
    ///
    /// Returns `Timeout` if nothing arrived. May return a partial response;
    /// framing is the caller's concern.
    async fn read(&mut self, timeout: Duration) -> ObdResult<Vec<u8>>;

    /// Drop any input that arrived but was never read.
    async fn discard_input(&mut self) -> ObdResult<()> {
        Ok(())
    }

    /// Close the channel. Further writes fail.
    async fn close(&mut self);
}

/// Serial port transport for ELM327 adapters
pub struct SerialTransport {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    device: String,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    /// Open a serial port at the given baud rate (8N1, no flow control)
    pub fn open(device: &str, baud_rate: u32) -> ObdResult<Self> {
        info!("Opening serial port {} at {} baud", device, baud_rate);

        let stream = tokio_serial::new(device, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ObdError::Connection(format!("{}: {}", device, e)))?;

        Ok(Self {
            device: device.to_string(),
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> ObdResult<&mut SerialStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ObdError::Connection(format!("{} is closed", self.device)))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, bytes: &[u8]) -> ObdResult<()> {
        let stream = self.stream()?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> ObdResult<Vec<u8>> {
        let mut buffer = [0u8; 256];
        let stream = self.stream()?;
        match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Err(_) => Err(ObdError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Ok(0)) => Err(ObdError::Serial("serial port closed".to_string())),
            Ok(Ok(n)) => Ok(buffer[..n].to_vec()),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn discard_input(&mut self) -> ObdResult<()> {
        let stream = self.stream()?;
        stream
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(|e| ObdError::Serial(e.to_string()))
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            info!("Closed serial port {}", self.device);
        }
    }
}

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,
    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,
    /// USB product ID (if USB device)
    pub pid: Option<u16>,
    /// Product name (if available)
    pub product: Option<String>,
}

/// Ports that usually carry an OBD-II adapter sort first.
fn port_rank(name: &str) -> u8 {
    let basename = name.rsplit('/').next().unwrap_or(name);
    let lower = basename.to_ascii_lowercase();
    if lower.contains("obd") {
        0
    } else if lower.starts_with("ttyusb") || lower.contains("usbserial") {
        1
    } else if lower.starts_with("ttyacm") {
        2
    } else if lower.starts_with("rfcomm") {
        3
    } else {
        4
    }
}

/// List serial ports that could host an adapter, likely candidates first
pub fn list_ports() -> Vec<PortInfo> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("Serial port enumeration failed: {}", e);
            return Vec::new();
        }
    };

    let mut found: Vec<PortInfo> = ports
        .into_iter()
        .map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => PortInfo {
                name: info.port_name,
                vid: None,
                pid: None,
                product: None,
            },
        })
        .collect();

    found.sort_by(|a, b| {
        port_rank(&a.name)
            .cmp(&port_rank(&b.name))
            .then_with(|| a.name.cmp(&b.name))
    });
    found.dedup_by(|a, b| a.name == b.name);
    debug!("Found {} serial ports", found.len());
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_rank_prefers_adapters() {
        let mut names = vec![
            "/dev/ttyS0",
            "/dev/rfcomm0",
            "/dev/ttyACM0",
            "/dev/ttyUSB0",
            "/dev/tty.OBDII-Port",
        ];
        names.sort_by_key(|n| port_rank(n));
        assert_eq!(
            names,
            vec![
                "/dev/tty.OBDII-Port",
                "/dev/ttyUSB0",
                "/dev/ttyACM0",
                "/dev/rfcomm0",
                "/dev/ttyS0"
            ]
        );
    }

    #[tokio::test]
    async fn test_open_missing_port_is_connection_error() {
        let result = SerialTransport::open("/dev/does-not-exist-obd", DEFAULT_BAUD_RATE);
        assert!(matches!(result, Err(ObdError::Connection(_))));
    }
}
