//! Line-oriented command channel for a device running its application firmware.
//!
//! Commands are written fire-and-forget; whatever the device prints comes back
//! through [`CommandChannel::receive_loop`] and is kept in an output buffer.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use super::config::{COMMAND_TERMINATOR, RECEIVE_BUFFER_SIZE, RECEIVE_POLL_TIMEOUT_MS};
use super::connection::Connection;
use super::error::{FlashError, FlashResult};
use super::transport::{write_all, ReadOutcome, Transport};

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The connection was closed.
    Disconnected,
    /// The device closed the stream.
    EndOfStream,
    /// A read failed and the transport reported itself unusable.
    Unhealthy,
}

/// Send commands and collect device output over a shared connection.
pub struct CommandChannel<T: Transport> {
    connection: Connection<T>,
    terminator: String,
    output: Arc<Mutex<String>>,
}

impl<T: Transport> Clone for CommandChannel<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            terminator: self.terminator.clone(),
            output: Arc::clone(&self.output),
        }
    }
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(connection: Connection<T>) -> Self {
        Self {
            connection,
            terminator: COMMAND_TERMINATOR.to_string(),
            output: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.connection
    }

    /// Write `command` followed by the line terminator.
    pub fn send(&self, command: &str) -> FlashResult<()> {
        if self.connection.is_flashing() {
            return Err(FlashError::FlashInProgress);
        }
        if !self.connection.is_connected() {
            return Err(FlashError::NotConnected);
        }

        let line = format!("{}{}", command, self.terminator);
        self.connection
            .with_transport(|transport| write_all(transport, line.as_bytes()))?;
        debug!("Sent command: {}", command);
        Ok(())
    }

    /// Read device output until the connection closes.
    ///
    /// Each decoded piece is appended to [`output`](Self::output) and passed to
    /// `on_text`. Read errors go to `on_error`; the loop only gives up on them
    /// once the transport reports itself unhealthy.
    pub fn receive_loop<F, E>(&self, mut on_text: F, mut on_error: E) -> LoopExit
    where
        F: FnMut(&str),
        E: FnMut(&FlashError),
    {
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        let mut decoder = Utf8Decoder::default();

        let exit = loop {
            if !self.connection.is_connected() {
                break LoopExit::Disconnected;
            }

            // The lock is held for one read at a time so commands can interleave.
            let result = match self.connection.try_lock_idle() {
                Some(mut transport) => transport.read(&mut buffer, RECEIVE_POLL_TIMEOUT_MS),
                None => {
                    std::thread::sleep(Duration::from_millis(RECEIVE_POLL_TIMEOUT_MS));
                    continue;
                }
            };

            match result {
                Ok(ReadOutcome::Data(n)) => {
                    let text = decoder.decode(&buffer[..n]);
                    self.deliver(&text, &mut on_text);
                }
                Ok(ReadOutcome::Timeout) => {}
                Ok(ReadOutcome::EndOfStream) => break LoopExit::EndOfStream,
                Err(e) => {
                    if !self.connection.is_connected() {
                        break LoopExit::Disconnected;
                    }
                    warn!("Receive error: {}", e);
                    on_error(&e);

                    let healthy = self
                        .connection
                        .try_lock_idle()
                        .map(|mut transport| transport.is_healthy())
                        .unwrap_or(true);
                    if !healthy {
                        break LoopExit::Unhealthy;
                    }
                }
            }
        };

        let rest = decoder.finish();
        self.deliver(&rest, &mut on_text);

        info!("Receive loop stopped: {:?}", exit);
        exit
    }

    /// Run [`receive_loop`](Self::receive_loop) on its own thread.
    pub fn spawn_receive_loop<F, E>(&self, on_text: F, on_error: E) -> JoinHandle<LoopExit>
    where
        T: 'static,
        F: FnMut(&str) + Send + 'static,
        E: FnMut(&FlashError) + Send + 'static,
    {
        let channel = self.clone();
        std::thread::spawn(move || channel.receive_loop(on_text, on_error))
    }

    /// Everything received so far.
    pub fn output(&self) -> String {
        self.lock_output().clone()
    }

    pub fn clear_output(&self) {
        self.lock_output().clear();
    }

    fn deliver<F: FnMut(&str)>(&self, text: &str, on_text: &mut F) {
        if text.is_empty() {
            return;
        }
        self.lock_output().push_str(text);
        on_text(text);
    }

    fn lock_output(&self) -> MutexGuard<'_, String> {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// UTF-8 decoder that carries incomplete sequences across reads.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much as possible; invalid bytes become U+FFFD.
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        None => {
                            // Truncated sequence; wait for the next read.
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        text
    }

    /// Flush a trailing incomplete sequence.
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
