//! Shared connection state.
//!
//! A [`Connection`] owns the transport and two flags: `connected`, read by the
//! command receive loop before every read, and `flashing`, which gives one
//! flash operation exclusive write access for its whole duration.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use log::info;

use super::error::{FlashError, FlashResult};
use super::transport::{PortConfig, Transport};

/// Cooperative cancellation flag checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect before the next block.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Transport plus the flags coordinating flashing and the command channel.
///
/// Cloning yields another handle to the same connection.
pub struct Connection<T: Transport> {
    transport: Arc<Mutex<T>>,
    connected: Arc<AtomicBool>,
    flashing: Arc<AtomicBool>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            connected: Arc::clone(&self.connected),
            flashing: Arc::clone(&self.flashing),
        }
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap a transport that is already open.
    pub fn new(transport: T) -> Self {
        let connected = transport.is_open();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            connected: Arc::new(AtomicBool::new(connected)),
            flashing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open `transport` with `config` and wrap it.
    pub fn open(mut transport: T, config: &PortConfig) -> FlashResult<Self> {
        transport.open(config)?;
        info!("Connected to {} at {} baud", config.port_name, config.baud_rate);
        Ok(Self::new(transport))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_flashing(&self) -> bool {
        self.flashing.load(Ordering::SeqCst)
    }

    /// Mark the connection closed and close the transport.
    ///
    /// The receive loop notices the flag on its next iteration. Waits for an
    /// in-flight flash to release the transport.
    pub fn disconnect(&self) -> FlashResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut transport = self.lock_transport();
        transport.close()?;
        info!("Disconnected");
        Ok(())
    }

    /// Take exclusive write access for a flash operation.
    ///
    /// Fails with [`FlashError::FlashInProgress`] if another flash holds it.
    pub fn begin_flash(&self) -> FlashResult<FlashGuard<'_, T>> {
        if self
            .flashing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FlashError::FlashInProgress);
        }

        Ok(FlashGuard {
            transport: self.lock_transport(),
            flashing: &self.flashing,
            connected: &self.connected,
        })
    }

    /// Lock the transport for a short operation (command write, single read).
    ///
    /// Returns `None` while a flash holds the transport.
    pub(crate) fn try_lock_idle(&self) -> Option<MutexGuard<'_, T>> {
        if self.is_flashing() {
            return None;
        }
        match self.transport.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        }
    }

    /// Run `f` with the transport locked.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut transport = self.lock_transport();
        f(&mut transport)
    }

    fn lock_transport(&self) -> MutexGuard<'_, T> {
        // A panic while holding the lock leaves the transport usable.
        self.transport
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive access to the transport for one flash operation.
///
/// Dropping the guard releases both the lock and the `flashing` flag, and
/// updates `connected` to whether the transport is still open (a bootloader
/// exit may leave it closed).
pub struct FlashGuard<'a, T: Transport> {
    transport: MutexGuard<'a, T>,
    flashing: &'a AtomicBool,
    connected: &'a AtomicBool,
}

impl<T: Transport> Deref for FlashGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> DerefMut for FlashGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Drop for FlashGuard<'_, T> {
    fn drop(&mut self) {
        self.connected
            .store(self.transport.is_open(), Ordering::SeqCst);
        self.flashing.store(false, Ordering::SeqCst);
    }
}
