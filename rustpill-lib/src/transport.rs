use crate::constants::{BOARD_PRODUCT, DEFAULT_BAUD_RATE};
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Byte-oriented duplex link to the board.
///
/// `read` must return within roughly `timeout`, yielding `Ok(0)` when nothing
/// arrived. `write_all` blocks until every byte has been handed to the driver.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Drop and re-open the underlying link
    fn reconnect(&mut self) -> Result<()> {
        Err(ClientError::Transport(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport cannot reconnect",
        )))
    }

    /// Release the underlying link. Later reads and writes fail until `reconnect`.
    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        true
    }
}

/// Parameters for opening a serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    /// Upper bound on a single blocking read
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(50),
        }
    }
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// [`Transport`] over a (usually USB CDC) serial port
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(config: SerialConfig) -> Result<Self> {
        let port = Self::open_port(&config)?;
        Ok(Self {
            config,
            port: Some(port),
        })
    }

    fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>> {
        if config.path.is_empty() {
            return Err(ClientError::invalid("serial port path is empty"));
        }
        let port = serialport::new(&config.path, config.baud_rate)
            .timeout(config.read_timeout)
            .open()?;
        info!(path = %config.path, baud_rate = config.baud_rate, "Serial port opened");
        Ok(port)
    }

    /// Open the board by USB serial number, or the first port reporting the
    /// board's product string when no serial number is given.
    ///
    /// `config.path` is replaced by the path of the matching port.
    pub fn find(serial_number: Option<&str>, config: SerialConfig) -> Result<Self> {
        let ports = available_ports()?;
        let port = select_port(&ports, serial_number, BOARD_PRODUCT).ok_or_else(|| {
            let wanted = match serial_number {
                Some(serial) => format!("no serial port with S/N {serial}"),
                None => format!("no serial port reporting product {BOARD_PRODUCT:?}"),
            };
            ClientError::PortUnavailable(serialport::Error::new(serialport::ErrorKind::NoDevice, wanted))
        })?;
        info!(
            port = %port.port_name,
            serial_number = port.serial_number.as_deref().unwrap_or("N/A"),
            "Found board"
        );
        Self::open(SerialConfig {
            path: port.port_name.clone(),
            ..config
        })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| ClientError::Transport(io::Error::new(io::ErrorKind::NotConnected, "serial port closed")))
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let timeout = timeout.min(self.config.read_timeout);
        let port = self.port()?;
        port.set_timeout(timeout)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port()?.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.port()?.flush()?;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.port = None;
        self.port = Some(Self::open_port(&self.config)?);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(path = %self.config.path, "Serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

/// A serial port found on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSummary {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Pick the board among `ports`: by serial number when one is given, otherwise
/// the first port whose USB product string is `product`.
pub fn select_port<'a>(
    ports: &'a [PortSummary],
    serial_number: Option<&str>,
    product: &str,
) -> Option<&'a PortSummary> {
    let mut matching = ports.iter().filter(|port| match serial_number {
        Some(serial) => port.serial_number.as_deref() == Some(serial),
        None => port.product.as_deref() == Some(product),
    });
    let first = matching.next()?;
    if serial_number.is_none() && matching.next().is_some() {
        warn!(port = %first.port_name, "Several boards attached, using the first one");
    }
    Some(first)
}

/// List the serial ports present on this host
pub fn available_ports() -> Result<Vec<PortSummary>> {
    let ports = serialport::available_ports()?;
    debug!(count = ports.len(), "Enumerated serial ports");
    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => PortSummary {
                port_name: port.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => PortSummary {
                port_name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect())
}
