//! Error types for the firmware transfer engine.

use std::fmt;

use thiserror::Error;

/// Result type alias for engine operations.
pub type FlashResult<T> = Result<T, FlashError>;

/// Handshake phase in which a bootloader entry/exit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Application,
    Triggering,
    AwaitingReenumeration,
    BootloaderReady,
    Resetting,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakePhase::Application => "application",
            HandshakePhase::Triggering => "triggering",
            HandshakePhase::AwaitingReenumeration => "awaiting re-enumeration",
            HandshakePhase::BootloaderReady => "bootloader ready",
            HandshakePhase::Resetting => "resetting",
        };
        f.write_str(name)
    }
}

/// Failures of the underlying byte-stream device.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted on a transport that is not open.
    #[error("Transport is not open")]
    NotOpen,

    /// Serial port is busy (in use by another process).
    #[error("Port '{port}' is busy or in use by another application")]
    PortBusy { port: String },

    /// Permission denied accessing serial port.
    #[error("Permission denied for port '{port}'")]
    PortPermissionDenied { port: String },

    /// The named port does not exist (device unplugged or not yet enumerated).
    #[error("Port '{port}' not found")]
    PortNotFound { port: String },

    /// Fewer bytes were accepted than requested.
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

/// Errors that can occur during parsing, encoding or flashing.
#[derive(Debug, Error)]
pub enum FlashError {
    /// A line of Intel HEX input could not be parsed.
    #[error("Malformed HEX record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    /// Payload does not fit into a UF2 block.
    #[error("Block payload of {size} bytes exceeds maximum {max_size}")]
    BlockOverflow { size: usize, max_size: usize },

    /// Bytes handed to the UF2 decoder are not a valid block.
    #[error("Invalid UF2 block: {reason}")]
    InvalidBlock { reason: String },

    /// Open/close/read/write failure of the transport.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Bootloader entry or exit failed.
    #[error("Bootloader handshake failed while {phase}: {source}")]
    BootloaderHandshakeFailed {
        phase: HandshakePhase,
        #[source]
        source: Box<FlashError>,
    },

    /// Re-enumerated device did not show up in time.
    #[error("Bootloader not found within {timeout_ms}ms")]
    BootloaderTimeout { timeout_ms: u64 },

    /// Writing a block failed; the flash was aborted at this block.
    #[error("Writing block {block_index} failed: {source}")]
    BlockWriteFailed {
        block_index: usize,
        #[source]
        source: TransportError,
    },

    /// Another flash operation already holds the transport.
    #[error("A flash operation is already in progress")]
    FlashInProgress,

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled by user")]
    Cancelled,

    /// A tunable is out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Firmware image has no bytes to send.
    #[error("Firmware image is empty")]
    EmptyImage,

    /// The connection has been closed.
    #[error("Not connected")]
    NotConnected,

    /// Standard I/O error (firmware and settings files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings JSON could not be read or written.
    #[error("Settings error: {0}")]
    Config(#[from] serde_json::Error),

    /// The background flash task panicked or was aborted.
    #[error("Flash task failed: {reason}")]
    TaskFailed { reason: String },
}

impl From<serialport::Error> for FlashError {
    fn from(e: serialport::Error) -> Self {
        FlashError::Transport(TransportError::Serial(e))
    }
}

impl FlashError {
    /// Wrap an error as a handshake failure in the given phase.
    pub fn handshake(phase: HandshakePhase, source: FlashError) -> Self {
        FlashError::BootloaderHandshakeFailed {
            phase,
            source: Box::new(source),
        }
    }

    /// Whether this error must abort the operation in progress.
    ///
    /// Reentrancy and not-connected rejections leave a running session untouched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FlashError::FlashInProgress | FlashError::NotConnected)
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            FlashError::MalformedRecord { .. } => "FW-010",
            FlashError::BlockOverflow { .. } => "FW-020",
            FlashError::InvalidBlock { .. } => "FW-021",
            FlashError::Transport(_) => "FW-001",
            FlashError::BootloaderHandshakeFailed { .. } => "FW-030",
            FlashError::BootloaderTimeout { .. } => "FW-031",
            FlashError::BlockWriteFailed { .. } => "FW-040",
            FlashError::FlashInProgress => "FW-050",
            FlashError::NotConnected => "FW-051",
            FlashError::EmptyImage => "FW-060",
            FlashError::InvalidConfig { .. } => "FW-004",
            FlashError::Io(_) => "FW-002",
            FlashError::Config(_) => "FW-003",
            FlashError::TaskFailed { .. } => "FW-005",
            FlashError::Cancelled => "FW-099",
        }
    }
}
