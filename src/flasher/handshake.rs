//! Bootloader entry and exit.
//!
//! Entry uses the "1200 baud touch": the application firmware watches for the
//! port being opened at the touch baud rate and, on the following DTR drop,
//! resets into its bootloader. The device then re-enumerates and a
//! [`DeviceWatcher`] locates it again.
//!
//! ```text
//! Application -> Triggering -> AwaitingReenumeration -> BootloaderReady
//!                                                          |
//!                 Application <- Resetting <- (flash) <----+
//! ```

use std::time::Duration;

use log::{debug, info};

use super::config::{
    DEFAULT_SETTLE_DELAY, NORMAL_BAUD_RATE, REENUMERATION_TIMEOUT_MS, TOUCH_BAUD_RATE,
    TOUCH_OPEN_TIMEOUT, TOUCH_SIGNAL_HOLD,
};
use super::device::DeviceWatcher;
use super::error::{FlashError, FlashResult, HandshakePhase};
use super::transport::{ControlSignals, PortConfig, Transport};

/// Tunables for the touch handshake; differ per device family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Baud rate the application firmware treats as the reset trigger.
    pub touch_baud_rate: u32,
    /// Baud rate for talking to the bootloader.
    pub normal_baud_rate: u32,
    /// How long the signals stay asserted before the trigger edge.
    pub signal_hold: Duration,
    /// Wait after the touch before looking for the device.
    pub settle_delay: Duration,
    /// Maximum wait for the device to re-enumerate.
    pub reenumeration_timeout: Duration,
    /// Reopen the original port once the bootloader has been released.
    pub reopen_after_reset: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            touch_baud_rate: TOUCH_BAUD_RATE,
            normal_baud_rate: NORMAL_BAUD_RATE,
            signal_hold: TOUCH_SIGNAL_HOLD,
            settle_delay: DEFAULT_SETTLE_DELAY,
            reenumeration_timeout: Duration::from_millis(REENUMERATION_TIMEOUT_MS),
            reopen_after_reset: false,
        }
    }
}

/// State machine forcing a device into its bootloader and back.
#[derive(Debug)]
pub struct BootloaderHandshake {
    config: HandshakeConfig,
    phase: HandshakePhase,
    original: Option<PortConfig>,
}

impl BootloaderHandshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            phase: HandshakePhase::Application,
            original: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    fn transition(&mut self, next: HandshakePhase) {
        info!("Bootloader handshake: {} -> {}", self.phase, next);
        self.phase = next;
    }

    /// Run `Application -> BootloaderReady`.
    ///
    /// On success the transport is open on the bootloader's port at the normal
    /// baud rate; the returned config describes that port.
    pub fn enter_bootloader<T, W>(
        &mut self,
        transport: &mut T,
        port: &PortConfig,
        watcher: &mut W,
    ) -> FlashResult<PortConfig>
    where
        T: Transport + ?Sized,
        W: DeviceWatcher + ?Sized,
    {
        self.original = Some(port.clone());

        self.transition(HandshakePhase::Triggering);
        watcher.prepare(&port.port_name);
        self.touch(transport, port)
            .map_err(|e| FlashError::handshake(HandshakePhase::Triggering, e))?;

        self.transition(HandshakePhase::AwaitingReenumeration);
        debug!("Settling for {:?}", self.config.settle_delay);
        std::thread::sleep(self.config.settle_delay);

        let bootloader_port = watcher
            .wait_for_device(&port.port_name, self.config.reenumeration_timeout)
            .map_err(|e| FlashError::handshake(HandshakePhase::AwaitingReenumeration, e))?;

        let bootloader = port
            .clone()
            .with_port(bootloader_port)
            .with_baud(self.config.normal_baud_rate);
        transport
            .open(&bootloader)
            .map_err(|e| FlashError::handshake(HandshakePhase::AwaitingReenumeration, e))?;

        self.transition(HandshakePhase::BootloaderReady);
        info!("Bootloader ready on {}", bootloader.port_name);
        Ok(bootloader)
    }

    /// Run `BootloaderReady -> Application` after the image was written.
    pub fn exit_bootloader<T>(&mut self, transport: &mut T) -> FlashResult<()>
    where
        T: Transport + ?Sized,
    {
        self.transition(HandshakePhase::Resetting);

        self.release(transport)
            .map_err(|e| FlashError::handshake(HandshakePhase::Resetting, e))?;

        self.transition(HandshakePhase::Application);
        Ok(())
    }

    /// Drop signals to boot the application, optionally reopening the original port.
    fn release<T>(&self, transport: &mut T) -> FlashResult<()>
    where
        T: Transport + ?Sized,
    {
        if transport.is_open() {
            transport.set_control_signals(ControlSignals::DROPPED)?;
        }
        transport.close()?;

        if self.config.reopen_after_reset {
            if let Some(original) = &self.original {
                let config = original.clone().with_baud(self.config.normal_baud_rate);
                transport.open(&config)?;
            }
        }
        Ok(())
    }

    /// Drop signals, reopen at the touch baud rate and pulse DTR.
    fn touch<T>(&self, transport: &mut T, port: &PortConfig) -> FlashResult<()>
    where
        T: Transport + ?Sized,
    {
        if transport.is_open() {
            transport.set_control_signals(ControlSignals::DROPPED)?;
        }
        transport.close()?;

        let touch = port
            .clone()
            .with_baud(self.config.touch_baud_rate)
            .with_timeout(TOUCH_OPEN_TIMEOUT);
        transport.open(&touch)?;

        transport.set_control_signals(ControlSignals::ASSERTED)?;
        std::thread::sleep(self.config.signal_hold);
        // The high-to-low transition triggers the bootloader
        transport.set_control_signals(ControlSignals::DROPPED)?;

        transport.close()
    }
}
