use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::flasher::error::{FlashResult, TransportError};
use crate::flasher::transport::{ControlSignals, PortConfig, ReadOutcome, Transport};

/// One recorded call on a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Open(String, u32),
    Close,
    Write(Vec<u8>),
    Signals(ControlSignals),
}

/// Scripted result for the next read.
#[derive(Debug, Clone)]
pub enum ScriptedRead {
    Data(Vec<u8>),
    EndOfStream,
    Error,
}

#[derive(Debug, Default)]
struct State {
    open: bool,
    healthy: bool,
    ops: Vec<TransportOp>,
    reads: VecDeque<ScriptedRead>,
    writes_done: usize,
    fail_write_at: Option<usize>,
    fail_open: bool,
}

/// In-memory transport that records every call.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    /// A closed transport.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                healthy: true,
                ..State::default()
            })),
        }
    }

    /// A transport that is already open (the open is not recorded).
    pub fn open_on(_port: &str) -> Self {
        let transport = Self::new();
        transport.state().open = true;
        transport
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("transport state poisoned")
    }

    /// All recorded calls in order.
    pub fn ops(&self) -> Vec<TransportOp> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Payloads of every successful write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match op {
                TransportOp::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make the write with this zero-based index fail.
    pub fn fail_write_at(&self, index: usize) {
        self.state().fail_write_at = Some(index);
    }

    pub fn fail_open(&self) {
        self.state().fail_open = true;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state().healthy = healthy;
    }

    /// Queue bytes for a future read.
    pub fn push_read(&self, data: &[u8]) {
        self.state().reads.push_back(ScriptedRead::Data(data.to_vec()));
    }

    pub fn push_eof(&self) {
        self.state().reads.push_back(ScriptedRead::EndOfStream);
    }

    pub fn push_read_error(&self) {
        self.state().reads.push_back(ScriptedRead::Error);
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, config: &PortConfig) -> FlashResult<()> {
        let mut state = self.state();
        if state.fail_open {
            return Err(TransportError::PortNotFound {
                port: config.port_name.clone(),
            }
            .into());
        }
        state.open = true;
        state
            .ops
            .push(TransportOp::Open(config.port_name.clone(), config.baud_rate));
        Ok(())
    }

    fn close(&mut self) -> FlashResult<()> {
        let mut state = self.state();
        state.open = false;
        state.ops.push(TransportOp::Close);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn write(&mut self, data: &[u8]) -> FlashResult<usize> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen.into());
        }
        let index = state.writes_done;
        state.writes_done += 1;
        if state.fail_write_at == Some(index) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted write failure",
            ))
            .into());
        }
        state.ops.push(TransportOp::Write(data.to_vec()));
        Ok(data.len())
    }

    fn read(&mut self, buffer: &mut [u8], timeout_ms: u64) -> FlashResult<ReadOutcome> {
        let next = {
            let mut state = self.state();
            if !state.open {
                return Err(TransportError::NotOpen.into());
            }
            state.reads.pop_front()
        };

        match next {
            Some(ScriptedRead::Data(data)) => {
                let n = data.len().min(buffer.len());
                buffer[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.state()
                        .reads
                        .push_front(ScriptedRead::Data(data[n..].to_vec()));
                }
                Ok(ReadOutcome::Data(n))
            }
            Some(ScriptedRead::EndOfStream) => Ok(ReadOutcome::EndOfStream),
            Some(ScriptedRead::Error) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "scripted read failure",
            ))
            .into()),
            None => {
                std::thread::sleep(Duration::from_millis(timeout_ms.min(5)));
                Ok(ReadOutcome::Timeout)
            }
        }
    }

    fn set_control_signals(&mut self, signals: ControlSignals) -> FlashResult<()> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen.into());
        }
        state.ops.push(TransportOp::Signals(signals));
        Ok(())
    }

    fn is_healthy(&mut self) -> bool {
        let state = self.state();
        state.open && state.healthy
    }
}
