//! Async entry points for flashing.
//!
//! The engine is blocking; these wrappers run it on tokio's blocking pool and
//! forward its events as serializable progress updates.

use std::path::PathBuf;

use log::info;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::flasher::{
    list_serial_devices, BootloaderEntry, CancelToken, Connection, DeviceWatcher,
    FirmwareImage, FlashError, FlashEvent, FlashOrchestrator, FlashReport, FlashResult,
    SerialDevice, SerialPortWatcher, SerialTransport, Transport,
};
use crate::settings::EngineSettings;

/// Progress event sent to the caller during a flash.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FlashProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Block just written (for progress events).
    pub block_index: Option<usize>,
    /// Total blocks (for progress events).
    pub total_blocks: Option<usize>,
    /// Progress percentage (0-100).
    pub percent: Option<u8>,
    /// Human-readable message.
    pub message: String,
    /// Support code when the flash failed.
    pub error_code: Option<String>,
}

impl FlashProgressEvent {
    fn named(stage: &str, message: String) -> Self {
        Self {
            stage: stage.to_string(),
            block_index: None,
            total_blocks: None,
            percent: None,
            message,
            error_code: None,
        }
    }
}

impl From<FlashEvent> for FlashProgressEvent {
    fn from(event: FlashEvent) -> Self {
        match event {
            FlashEvent::Phase(phase) => {
                let stage = match serde_json::to_value(phase) {
                    Ok(serde_json::Value::String(name)) => name,
                    _ => format!("{:?}", phase),
                };
                Self::named(&stage, phase.message().to_string())
            }
            FlashEvent::Progress {
                block_index,
                total_blocks,
                percent,
                ..
            } => Self {
                block_index: Some(block_index),
                total_blocks: Some(total_blocks),
                percent: Some(percent),
                ..Self::named(
                    "progress",
                    format!("Writing block {}/{}", block_index + 1, total_blocks),
                )
            },
            FlashEvent::Log { message } => Self::named("log", message),
            FlashEvent::Completed(report) => Self {
                percent: Some(100),
                ..Self::named(
                    "complete",
                    format!(
                        "Flashed {} bytes in {} blocks",
                        report.bytes_transferred, report.blocks_written
                    ),
                )
            },
            FlashEvent::Failed { reason } => Self {
                error_code: Some(reason.code.to_string()),
                ..Self::named("failed", reason.message)
            },
        }
    }
}

/// One flash job.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    /// Port the device is on in application mode.
    pub port_name: String,
    pub image: FirmwareImage,
    pub settings: EngineSettings,
    pub cancel: CancelToken,
}

/// Detect serial devices.
pub async fn detect_devices() -> FlashResult<Vec<SerialDevice>> {
    tokio::task::spawn_blocking(list_serial_devices)
        .await
        .map_err(task_failed)
}

/// Flash over an existing connection.
///
/// `watcher` locates the device after the bootloader touch and is only used
/// when the settings ask for bootloader entry.
pub async fn flash_image<T>(
    connection: Connection<T>,
    request: FlashRequest,
    watcher: Box<dyn DeviceWatcher>,
    progress: UnboundedSender<FlashProgressEvent>,
) -> FlashResult<FlashReport>
where
    T: Transport + 'static,
{
    tokio::task::spawn_blocking(move || {
        let FlashRequest {
            port_name,
            image,
            settings,
            cancel,
        } = request;

        settings.validate()?;
        let strategy = settings.strategy()?;

        let mut orchestrator = FlashOrchestrator::new().with_cancel_token(cancel);
        if settings.enter_bootloader {
            orchestrator = orchestrator.with_bootloader(BootloaderEntry {
                port: settings.port_config(port_name),
                config: settings.handshake_config(),
                watcher,
            });
        }

        orchestrator.flash(&image, &connection, strategy.as_ref(), |event| {
            // A dropped receiver only means nobody is listening
            let _ = progress.send(FlashProgressEvent::from(event));
        })
    })
    .await
    .map_err(task_failed)?
}

/// Load a firmware file and flash it to the device on `serial_port`.
///
/// # Arguments
/// * `serial_port` - Serial port of the device
/// * `firmware_path` - Path to a `.hex` or raw binary image
/// * `settings` - Engine settings
/// * `cancel` - Token to abort between blocks
/// * `progress` - Channel for progress updates
pub async fn flash_firmware(
    serial_port: String,
    firmware_path: PathBuf,
    settings: EngineSettings,
    cancel: CancelToken,
    progress: UnboundedSender<FlashProgressEvent>,
) -> FlashResult<FlashReport> {
    let port_config = settings.port_config(serial_port.as_str());
    let hex_options = settings.hex_options();

    let (connection, image) = tokio::task::spawn_blocking(move || -> FlashResult<_> {
        let image = FirmwareImage::load(&firmware_path, hex_options)?;
        let connection = Connection::open(SerialTransport::new(), &port_config)?;
        Ok((connection, image))
    })
    .await
    .map_err(task_failed)??;

    info!("Flashing {} bytes to {}", image.len(), serial_port);

    let request = FlashRequest {
        port_name: serial_port,
        image,
        settings,
        cancel,
    };
    let result = flash_image(
        connection.clone(),
        request,
        Box::new(SerialPortWatcher::new()),
        progress,
    )
    .await;

    if connection.is_connected() {
        connection.disconnect()?;
    }
    result
}

fn task_failed(e: tokio::task::JoinError) -> FlashError {
    FlashError::TaskFailed {
        reason: e.to_string(),
    }
}
