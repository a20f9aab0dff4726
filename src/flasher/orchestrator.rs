//! Top-level flash driver.
//!
//! Orchestrates one flash operation:
//! 1. Preparing - validate the image and count blocks
//! 2. EnteringBootloader - optional touch handshake
//! 3. Streaming - encode and write every block in order
//! 4. ExitingBootloader - optional release back to the application
//! 5. Completed, or Failed from any of the above

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::config::percent;
use super::connection::{CancelToken, Connection};
use super::device::DeviceWatcher;
use super::error::{FlashError, FlashResult};
use super::firmware::FirmwareImage;
use super::handshake::{BootloaderHandshake, HandshakeConfig};
use super::strategy::BlockEncodingStrategy;
use super::transport::{write_all, PortConfig, Transport};

/// Phase of a flash operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlashPhase {
    Idle,
    Preparing,
    EnteringBootloader,
    Streaming,
    ExitingBootloader,
    Completed,
    Failed,
}

impl FlashPhase {
    /// Human-readable description.
    pub fn message(&self) -> &'static str {
        match self {
            FlashPhase::Idle => "Idle",
            FlashPhase::Preparing => "Preparing firmware image...",
            FlashPhase::EnteringBootloader => "Entering bootloader...",
            FlashPhase::Streaming => "Writing firmware...",
            FlashPhase::ExitingBootloader => "Restarting device...",
            FlashPhase::Completed => "Flash complete",
            FlashPhase::Failed => "Flash failed",
        }
    }
}

/// Why a flash ended in `Failed`, in a form that can be cloned to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    /// Support code from [`FlashError::error_code`].
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Block being written when the failure happened, if any.
    pub block_index: Option<usize>,
    /// The caller requested the abort.
    pub cancelled: bool,
}

impl From<&FlashError> for FailureReason {
    fn from(error: &FlashError) -> Self {
        let block_index = match error {
            FlashError::BlockWriteFailed { block_index, .. } => Some(*block_index),
            _ => None,
        };
        Self {
            code: error.error_code(),
            message: error.to_string(),
            block_index,
            cancelled: matches!(error, FlashError::Cancelled),
        }
    }
}

/// Summary of a completed flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashReport {
    pub strategy: &'static str,
    pub blocks_written: usize,
    pub bytes_transferred: usize,
    /// Port the bootloader was found on, when the handshake ran.
    pub bootloader_port: Option<String>,
}

/// Events delivered to the progress sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// Entered a new phase.
    Phase(FlashPhase),
    /// A block was written.
    Progress {
        phase: FlashPhase,
        block_index: usize,
        total_blocks: usize,
        percent: u8,
    },
    /// Diagnostic message.
    Log { message: String },
    /// Terminal success.
    Completed(FlashReport),
    /// Terminal failure.
    Failed { reason: FailureReason },
}

/// Run-scoped state of one flash operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSession {
    pub total_blocks: usize,
    /// Number of blocks written so far (index of the next block).
    pub block_index: usize,
    pub bytes_transferred: usize,
    pub phase: FlashPhase,
}

impl FlashSession {
    fn new() -> Self {
        Self {
            total_blocks: 0,
            block_index: 0,
            bytes_transferred: 0,
            phase: FlashPhase::Idle,
        }
    }

    fn percent(&self) -> u8 {
        percent(self.block_index, self.total_blocks)
    }
}

/// Settings for driving the device into its bootloader around the flash.
pub struct BootloaderEntry {
    /// Port the device is on in application mode.
    pub port: PortConfig,
    pub config: HandshakeConfig,
    pub watcher: Box<dyn DeviceWatcher>,
}

/// Streams a firmware image to a device.
pub struct FlashOrchestrator {
    cancel: CancelToken,
    bootloader: Option<BootloaderEntry>,
}

impl Default for FlashOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashOrchestrator {
    pub fn new() -> Self {
        Self {
            cancel: CancelToken::new(),
            bootloader: None,
        }
    }

    /// Enter the bootloader before streaming and release it afterwards.
    pub fn with_bootloader(mut self, entry: BootloaderEntry) -> Self {
        self.bootloader = Some(entry);
        self
    }

    /// Use a caller-owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels the running flash between blocks.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Flash through a shared connection.
    ///
    /// Holds exclusive write access for the whole operation; a second call
    /// while one is running fails with [`FlashError::FlashInProgress`].
    pub fn flash<T, F>(
        &mut self,
        image: &FirmwareImage,
        connection: &Connection<T>,
        strategy: &dyn BlockEncodingStrategy,
        on_event: F,
    ) -> FlashResult<FlashReport>
    where
        T: Transport,
        F: FnMut(FlashEvent),
    {
        let mut guard = connection.begin_flash()?;
        self.flash_transport(image, &mut *guard, strategy, on_event)
    }

    /// Flash through a transport the caller holds exclusively.
    pub fn flash_transport<T, F>(
        &mut self,
        image: &FirmwareImage,
        transport: &mut T,
        strategy: &dyn BlockEncodingStrategy,
        mut on_event: F,
    ) -> FlashResult<FlashReport>
    where
        T: Transport + ?Sized,
        F: FnMut(FlashEvent),
    {
        let mut session = FlashSession::new();

        let result = match self.run(image, transport, strategy, &mut session, &mut on_event) {
            Ok(report) => {
                set_phase(&mut session, FlashPhase::Completed, &mut on_event);
                info!(
                    "Flash complete: {} blocks, {} bytes",
                    report.blocks_written, report.bytes_transferred
                );
                on_event(FlashEvent::Completed(report.clone()));
                Ok(report)
            }
            Err(error) => {
                warn!("Flash failed at block {}: {}", session.block_index, error);
                // Release the device; the session is not resumable.
                if let Err(close_error) = transport.close() {
                    warn!("Closing transport after failure: {}", close_error);
                }

                set_phase(&mut session, FlashPhase::Failed, &mut on_event);
                on_event(FlashEvent::Failed {
                    reason: FailureReason::from(&error),
                });
                Err(error)
            }
        };

        // A cancel applies to one flash only, including one issued before the call.
        self.cancel.reset();
        result
    }

    fn run<T, F>(
        &mut self,
        image: &FirmwareImage,
        transport: &mut T,
        strategy: &dyn BlockEncodingStrategy,
        session: &mut FlashSession,
        on_event: &mut F,
    ) -> FlashResult<FlashReport>
    where
        T: Transport + ?Sized,
        F: FnMut(FlashEvent),
    {
        set_phase(session, FlashPhase::Preparing, on_event);

        if image.is_empty() {
            return Err(FlashError::EmptyImage);
        }
        session.total_blocks = strategy.block_count(image);
        log_event(
            on_event,
            format!(
                "Flashing {} bytes (sha256 {}) as {} {} blocks of {} bytes",
                image.len(),
                image.sha256(),
                session.total_blocks,
                strategy.name(),
                strategy.block_size()
            ),
        );

        let mut handshake = None;
        let mut bootloader_port = None;
        if let Some(entry) = self.bootloader.as_mut() {
            set_phase(session, FlashPhase::EnteringBootloader, on_event);
            let mut state = BootloaderHandshake::new(entry.config.clone());
            let port = state.enter_bootloader(transport, &entry.port, entry.watcher.as_mut())?;
            log_event(on_event, format!("Bootloader ready on {}", port.port_name));
            bootloader_port = Some(port.port_name);
            handshake = Some(state);
        }

        set_phase(session, FlashPhase::Streaming, on_event);
        self.stream(image, transport, strategy, session, on_event)?;

        if let Some(mut state) = handshake {
            set_phase(session, FlashPhase::ExitingBootloader, on_event);
            state.exit_bootloader(transport)?;
        }

        Ok(FlashReport {
            strategy: strategy.name(),
            blocks_written: session.block_index,
            bytes_transferred: session.bytes_transferred,
            bootloader_port,
        })
    }

    /// Write every block in index order.
    fn stream<T, F>(
        &self,
        image: &FirmwareImage,
        transport: &mut T,
        strategy: &dyn BlockEncodingStrategy,
        session: &mut FlashSession,
        on_event: &mut F,
    ) -> FlashResult<()>
    where
        T: Transport + ?Sized,
        F: FnMut(FlashEvent),
    {
        let total = session.total_blocks;
        let block_size = strategy.block_size();
        let delay = strategy.inter_block_delay();

        for index in 0..total {
            if self.cancel.is_cancelled() {
                log_event(on_event, format!("Cancelled before block {}", index));
                return Err(FlashError::Cancelled);
            }

            let block = strategy.encode_block(image, index, total)?;
            write_all(transport, &block).map_err(|e| block_write_failed(index, e))?;

            let covered = block_size.min(image.len() - index * block_size);
            session.block_index = index + 1;
            session.bytes_transferred += covered;
            debug!(
                "Wrote block {}/{} ({} wire bytes)",
                index + 1,
                total,
                block.len()
            );

            on_event(FlashEvent::Progress {
                phase: session.phase,
                block_index: index,
                total_blocks: total,
                percent: session.percent(),
            });

            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }

        Ok(())
    }
}

fn set_phase<F: FnMut(FlashEvent)>(session: &mut FlashSession, phase: FlashPhase, on_event: &mut F) {
    debug!("Flash phase: {:?} -> {:?}", session.phase, phase);
    session.phase = phase;
    on_event(FlashEvent::Phase(phase));
}

fn log_event<F: FnMut(FlashEvent)>(on_event: &mut F, message: String) {
    debug!("{}", message);
    on_event(FlashEvent::Log { message });
}

fn block_write_failed(block_index: usize, error: FlashError) -> FlashError {
    match error {
        FlashError::Transport(source) => FlashError::BlockWriteFailed {
            block_index,
            source,
        },
        other => other,
    }
}
