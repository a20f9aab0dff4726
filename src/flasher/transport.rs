//! Byte-stream transport layer.
//!
//! Provides a trait-based abstraction over the device connection, enabling
//! both real hardware (serial) and mock testing.

use std::io::{Read, Write};
use std::time::Duration;

use log::debug;
#[cfg(test)]
use mockall::automock;
use serialport::SerialPort;

use super::config::{
    MAX_OPEN_RETRIES, NORMAL_BAUD_RATE, OPEN_RETRY_DELAY, SERIAL_READ_TIMEOUT,
};
use super::error::{FlashResult, TransportError};

/// Parameters for opening a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Serial port path (e.g., "/dev/cu.usbmodem1234" or "COM3").
    pub port_name: String,
    /// Baud rate; also used as the out-of-band bootloader trigger.
    pub baud_rate: u32,
    /// Default timeout for blocking operations.
    pub timeout: Duration,
}

impl PortConfig {
    /// Config for `port_name` at the normal operating baud rate.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: NORMAL_BAUD_RATE,
            timeout: SERIAL_READ_TIMEOUT,
        }
    }

    /// Same port, different baud rate.
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Same settings, different port.
    pub fn with_port(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = port_name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Line-level control signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSignals {
    /// Data Terminal Ready.
    pub dtr: bool,
    /// Request To Send.
    pub rts: bool,
}

impl ControlSignals {
    /// Both signals deasserted.
    pub const DROPPED: ControlSignals = ControlSignals {
        dtr: false,
        rts: false,
    };

    /// Both signals asserted.
    pub const ASSERTED: ControlSignals = ControlSignals {
        dtr: true,
        rts: true,
    };
}

/// Outcome of a single read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed at the start of the buffer.
    Data(usize),
    /// Nothing arrived before the timeout.
    Timeout,
    /// The device closed the stream.
    EndOfStream,
}

/// Trait for byte-stream transport operations.
///
/// A transport value is the connection handle: whoever holds it exclusively
/// may write to the device.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// Open (or reopen) the device with the given settings.
    fn open(&mut self, config: &PortConfig) -> FlashResult<()>;

    /// Close the device. Closing a closed transport is a no-op.
    fn close(&mut self) -> FlashResult<()>;

    /// Whether the transport currently holds an open device.
    fn is_open(&self) -> bool;

    /// Write data, returning the number of bytes written.
    fn write(&mut self, data: &[u8]) -> FlashResult<usize>;

    /// Read available data with a timeout.
    ///
    /// # Arguments
    /// * `buffer` - Buffer to read into
    /// * `timeout_ms` - Timeout in milliseconds
    fn read(&mut self, buffer: &mut [u8], timeout_ms: u64) -> FlashResult<ReadOutcome>;

    /// Drive the DTR/RTS lines.
    fn set_control_signals(&mut self, signals: ControlSignals) -> FlashResult<()>;

    /// Check if the connection is still healthy.
    ///
    /// Returns false once the handle should be discarded.
    fn is_healthy(&mut self) -> bool;
}

/// Write all of `data`, treating a short write as an error.
pub fn write_all<T: Transport + ?Sized>(transport: &mut T, data: &[u8]) -> FlashResult<()> {
    let written = transport.write(data)?;
    if written != data.len() {
        return Err(TransportError::ShortWrite {
            written,
            expected: data.len(),
        }
        .into());
    }
    Ok(())
}

/// Serial port transport implementation.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
}

impl SerialTransport {
    /// Create a closed transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and open a transport in one step.
    pub fn open_with(config: &PortConfig) -> FlashResult<Self> {
        let mut transport = Self::new();
        transport.open(config)?;
        Ok(transport)
    }

    /// Name of the port last opened, if any.
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for SerialTransport {
    /// Includes retry logic to handle transient failures during USB
    /// re-enumeration: the device may appear in port enumeration before the
    /// driver is fully ready.
    fn open(&mut self, config: &PortConfig) -> FlashResult<()> {
        self.close()?;

        let normalized_name = normalize_port_name(&config.port_name);
        let mut last_error: Option<serialport::Error> = None;

        for attempt in 0..MAX_OPEN_RETRIES {
            match serialport::new(&normalized_name, config.baud_rate)
                .timeout(config.timeout)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
            {
                Ok(port) => {
                    debug!(
                        "Opened {} at {} baud (attempt {})",
                        normalized_name,
                        config.baud_rate,
                        attempt + 1
                    );
                    self.port = Some(port);
                    self.port_name = Some(config.port_name.clone());
                    return Ok(());
                }
                Err(e) => {
                    let err_str = e.to_string().to_lowercase();

                    // "not functioning": Windows driver not ready after re-enumeration
                    let is_transient = err_str.contains("not functioning")
                        || err_str.contains("temporarily unavailable")
                        || err_str.contains("interrupted");

                    if is_transient && attempt < MAX_OPEN_RETRIES - 1 {
                        std::thread::sleep(OPEN_RETRY_DELAY);
                        last_error = Some(e);
                        continue;
                    }

                    return Err(classify_open_error(e, &config.port_name).into());
                }
            }
        }

        Err(match last_error {
            Some(e) => TransportError::Serial(e),
            None => TransportError::PortNotFound {
                port: config.port_name.clone(),
            },
        }
        .into())
    }

    fn close(&mut self) -> FlashResult<()> {
        if let Some(mut port) = self.port.take() {
            // Pending output is best-effort on close
            port.flush().ok();
            debug!("Closed {}", self.port_name.as_deref().unwrap_or("port"));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8]) -> FlashResult<usize> {
        let port = self.port_mut()?;
        // Single write call - the OS handles USB packetization.
        port.write_all(data).map_err(TransportError::Io)?;
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8], timeout_ms: u64) -> FlashResult<ReadOutcome> {
        let port = self.port_mut()?;
        port.set_timeout(Duration::from_millis(timeout_ms))
            .map_err(TransportError::Serial)?;

        match port.read(buffer) {
            Ok(0) => Ok(ReadOutcome::EndOfStream),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(ReadOutcome::Timeout),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(ReadOutcome::EndOfStream),
            Err(e) => Err(TransportError::Io(e).into()),
        }
    }

    fn set_control_signals(&mut self, signals: ControlSignals) -> FlashResult<()> {
        let port = self.port_mut()?;
        port.write_data_terminal_ready(signals.dtr)
            .map_err(TransportError::Serial)?;
        port.write_request_to_send(signals.rts)
            .map_err(TransportError::Serial)?;
        Ok(())
    }

    fn is_healthy(&mut self) -> bool {
        // If the port settings are readable the handle is likely still valid.
        match self.port.as_ref() {
            Some(port) => port.baud_rate().is_ok(),
            None => false,
        }
    }
}

/// Convert a serialport open error into the matching transport error.
fn classify_open_error(e: serialport::Error, port_name: &str) -> TransportError {
    let err_str = e.to_string().to_lowercase();
    match e.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            TransportError::PortPermissionDenied {
                port: port_name.to_string(),
            }
        }
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            TransportError::PortNotFound {
                port: port_name.to_string(),
            }
        }
        _ if err_str.contains("busy") || err_str.contains("in use") => TransportError::PortBusy {
            port: port_name.to_string(),
        },
        _ => TransportError::Serial(e),
    }
}

/// Normalize a port name for cross-platform compatibility.
pub(crate) fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if let Some(number) = name.strip_prefix("COM") {
            if let Ok(n) = number.parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
