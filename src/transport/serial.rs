//! Serial device access through tokio-serial.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info};

use crate::error::Result;
use crate::sink::PortInfo;

/// Default line speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Byte stream the session runs over.
///
/// Any async duplex stream qualifies, so tests can use `tokio::io::duplex`.
pub trait Port: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Port for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased port.
pub type BoxedPort = Box<dyn Port>;

/// Line settings applied on open. Always 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub baud: u32,
    /// Pulse DTR after opening (resets most boards).
    pub dtr: bool,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            dtr: false,
        }
    }
}

/// Opens and enumerates ports.
pub trait PortOpener: Send + Sync + 'static {
    /// Open `name` with `settings`.
    fn open(&self, name: &str, settings: &PortSettings) -> Result<BoxedPort>;

    /// Ports currently present on the system.
    fn list(&self) -> Result<Vec<PortInfo>>;
}

/// [`PortOpener`] backed by real serial devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    fn open(&self, name: &str, settings: &PortSettings) -> Result<BoxedPort> {
        Ok(Box::new(open_serial(name, settings)?))
    }

    fn list(&self) -> Result<Vec<PortInfo>> {
        list_ports()
    }
}

/// Open a serial device and flush anything left in its buffers.
pub fn open_serial(name: &str, settings: &PortSettings) -> Result<tokio_serial::SerialStream> {
    info!(port = %name, baud = settings.baud, dtr = settings.dtr, "Opening serial port");

    let mut stream = tokio_serial::new(name, settings.baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?;

    stream.clear(tokio_serial::ClearBuffer::All)?;

    if settings.dtr {
        stream.write_data_terminal_ready(true)?;
        stream.write_data_terminal_ready(false)?;
        debug!(port = %name, "DTR pulsed");
    }

    Ok(stream)
}

/// Enumerate serial ports.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let mut info = PortInfo {
                name: port.port_name,
                vid: String::new(),
                pid: String::new(),
                serial_number: String::new(),
                manufacturer: String::new(),
                is_open: false,
            };
            if let SerialPortType::UsbPort(usb) = port.port_type {
                info.vid = format!("0x{:04x}", usb.vid);
                info.pid = format!("0x{:04x}", usb.pid);
                info.serial_number = usb.serial_number.unwrap_or_default();
                info.manufacturer = usb.manufacturer.unwrap_or_default();
            }
            info
        })
        .collect())
}
