//! Serial firmware transfer engine.
//!
//! Streams firmware images to microcontrollers over a serial link, either as
//! raw chunks or as UF2 blocks, optionally forcing the device into its
//! bootloader first.
//!
//! # Flash Overview
//!
//! A flash operation consists of:
//! 1. **Image Loading** - Read a raw binary or decode Intel HEX
//! 2. **Bootloader Entry** - Optional 1200 baud touch and re-enumeration
//! 3. **Streaming** - Encode each block and write it in order
//! 4. **Bootloader Exit** - Release the device back to its application
//!
//! Outside of a flash, the same connection carries a line-oriented command
//! channel.
//!
//! # Example
//!
//! ```ignore
//! use fw_flasher::flasher::{
//!     config, Connection, FirmwareImage, FlashMode, FlashOrchestrator, HexParseOptions,
//!     PortConfig, SerialTransport,
//! };
//!
//! let image = FirmwareImage::load("blink.hex", HexParseOptions::default())?;
//! let connection = Connection::open(SerialTransport::new(), &PortConfig::new("/dev/ttyACM0"))?;
//! let strategy = FlashMode::default().strategy(config::INTER_CHUNK_DELAY)?;
//!
//! FlashOrchestrator::new().flash(&image, &connection, strategy.as_ref(), |event| {
//!     println!("{:?}", event);
//! })?;
//! ```

pub mod command;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod firmware;
pub mod handshake;
pub mod hex;
pub mod orchestrator;
pub mod strategy;
pub mod transport;
pub mod uf2;

// Command channel
pub use command::{CommandChannel, LoopExit};

// Connection and cancellation
pub use connection::{CancelToken, Connection, FlashGuard};

// Device discovery
pub use device::{list_serial_devices, DeviceWatcher, SamePortWatcher, SerialDevice, SerialPortWatcher};

// Errors
pub use error::{FlashError, FlashResult, HandshakePhase, TransportError};

// Images
pub use firmware::FirmwareImage;
pub use hex::{parse_hex, parse_hex_with, HexParseOptions, ParsedHex};

// Bootloader
pub use handshake::{BootloaderHandshake, HandshakeConfig};

// Flashing
pub use orchestrator::{
    BootloaderEntry, FailureReason, FlashEvent, FlashOrchestrator, FlashPhase, FlashReport,
    FlashSession,
};
pub use strategy::{BlockEncodingStrategy, FlashMode, RawChunked, Uf2Framed};

// Transport
pub use transport::{ControlSignals, PortConfig, ReadOutcome, SerialTransport, Transport};
