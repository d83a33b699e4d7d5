//! In-memory instrument.
//!
//! `MemoryDevice` stands in for a transport session: bytes pushed through a
//! clone of the device show up on the read side, and everything the backend
//! writes can be inspected afterwards. Canned replies can be attached to
//! exact writes, which is enough to script most request/response exchanges.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{DeviceInterface, VisaCapabilities, VisaSession};
use crate::error::{CommError, CommResult};

#[derive(Debug)]
struct MemoryState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    echo: bool,
    open: bool,
    opens: usize,
    closes: usize,
    flushes: usize,
    timeout_sets: usize,
    failing_opens: usize,
    timeout: Option<Duration>,
    timeout_native: Option<f64>,
    dtr: Option<bool>,
    locked: bool,
    read_term: Vec<u8>,
    write_term: Vec<u8>,
    visa: VisaCapabilities,
}

/// Scripted in-memory device. Clones share the same state.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    /// A closed device with no pending input
    pub fn new() -> Self {
        MemoryDevice {
            state: Arc::new(Mutex::new(MemoryState {
                incoming: VecDeque::new(),
                written: Vec::new(),
                replies: Vec::new(),
                echo: false,
                open: false,
                opens: 0,
                closes: 0,
                flushes: 0,
                timeout_sets: 0,
                failing_opens: 0,
                timeout: None,
                timeout_native: None,
                dtr: None,
                locked: false,
                read_term: Vec::new(),
                write_term: Vec::new(),
                visa: VisaCapabilities {
                    separate_termination: true,
                    timeout_in_millis: true,
                    locking: true,
                },
            })),
        }
    }

    pub fn with_visa_capabilities(self, caps: VisaCapabilities) -> Self {
        self.state.lock().visa = caps;
        self
    }

    /// Queue bytes for the reading side
    pub fn push(&self, data: impl AsRef<[u8]>) {
        self.state.lock().incoming.extend(data.as_ref());
    }

    /// Whenever exactly `request` is written, queue `reply`
    pub fn reply_to(&self, request: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) {
        self.state
            .lock()
            .replies
            .push((request.as_ref().to_vec(), reply.as_ref().to_vec()));
    }

    /// Send every write straight back to the reading side
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Make the next `count` open attempts fail
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().failing_opens = count;
    }

    /// Everything written so far, clearing the record
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().written)
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().incoming.len()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn timeout_sets(&self) -> usize {
        self.state.lock().timeout_sets
    }

    pub fn dtr(&self) -> Option<bool> {
        self.state.lock().dtr
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn native_timeout(&self) -> Option<f64> {
        self.state.lock().timeout_native
    }

    /// Terminators configured through the VISA session interface
    pub fn termination(&self) -> (Vec<u8>, Vec<u8>) {
        let state = self.state.lock();
        (state.read_term.clone(), state.write_term.clone())
    }

    fn open_session(&self) -> CommResult<()> {
        let mut state = self.state.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(CommError::Communication("device busy".to_owned()));
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn close_session(&self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
    }

    fn check_open(state: &MemoryState) -> CommResult<()> {
        if state.open {
            Ok(())
        } else {
            Err(CommError::Communication("memory device is not open".to_owned()))
        }
    }

    fn record_write(&self, data: &[u8]) -> CommResult<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.written.extend_from_slice(data);
        if state.echo {
            state.incoming.extend(data);
        }
        let replies: Vec<u8> = state
            .replies
            .iter()
            .filter(|(request, _)| request.as_slice() == data)
            .flat_map(|(_, reply)| reply.iter().copied())
            .collect();
        state.incoming.extend(replies);
        trace!("Sent bytes {:?}", data);
        Ok(())
    }
}

impl DeviceInterface for MemoryDevice {
    fn open(&mut self) -> CommResult<()> {
        self.open_session()
    }

    fn close(&mut self) -> CommResult<()> {
        self.close_session();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn read(&mut self, size: usize) -> CommResult<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let take = size.min(state.incoming.len());
        Ok(state.incoming.drain(..take).collect())
    }

    fn write(&mut self, data: &[u8]) -> CommResult<()> {
        self.record_write(data)
    }

    fn flush(&mut self) -> CommResult<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.flushes += 1;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> CommResult<()> {
        let mut state = self.state.lock();
        state.timeout = Some(timeout);
        state.timeout_sets += 1;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.state.lock().timeout
    }

    fn set_dtr(&mut self, level: bool) -> CommResult<()> {
        self.state.lock().dtr = Some(level);
        Ok(())
    }
}

impl VisaSession for MemoryDevice {
    fn capabilities(&self) -> VisaCapabilities {
        self.state.lock().visa
    }

    fn open(&mut self) -> CommResult<()> {
        self.open_session()
    }

    fn close(&mut self) -> CommResult<()> {
        self.close_session();
        Ok(())
    }

    fn read_message(&mut self) -> CommResult<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.incoming.is_empty() {
            return Err(CommError::Timeout("no message pending".to_owned()));
        }
        let mut message = Vec::new();
        // The end of the queued data plays the role of the end-of-message line
        while let Some(byte) = state.incoming.pop_front() {
            message.push(byte);
            if !state.read_term.is_empty() && message.ends_with(&state.read_term) {
                break;
            }
        }
        Ok(message)
    }

    fn read_bytes(&mut self, size: usize) -> CommResult<Vec<u8>> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.incoming.len() < size {
            return Err(CommError::Timeout(format!(
                "{} of {} bytes available",
                state.incoming.len(),
                size
            )));
        }
        Ok(state.incoming.drain(..size).collect())
    }

    fn write_message(&mut self, data: &[u8]) -> CommResult<()> {
        let mut message = data.to_vec();
        {
            let state = self.state.lock();
            let term = if state.visa.separate_termination {
                &state.write_term
            } else {
                &state.read_term
            };
            message.extend_from_slice(term);
        }
        self.record_write(&message)
    }

    fn set_timeout_native(&mut self, value: f64) -> CommResult<()> {
        let mut state = self.state.lock();
        state.timeout_native = Some(value);
        state.timeout_sets += 1;
        Ok(())
    }

    fn timeout_native(&self) -> Option<f64> {
        self.state.lock().timeout_native
    }

    fn set_termination(&mut self, read: &[u8], write: &[u8]) -> CommResult<()> {
        let mut state = self.state.lock();
        state.read_term = read.to_vec();
        state.write_term = write.to_vec();
        Ok(())
    }

    fn read_termination(&self) -> Vec<u8> {
        self.state.lock().read_term.clone()
    }

    fn lock(&mut self, _timeout: Option<f64>) -> CommResult<()> {
        let mut state = self.state.lock();
        if !state.visa.locking {
            return Err(CommError::Unsupported("session cannot lock".to_owned()));
        }
        state.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> CommResult<()> {
        self.state.lock().locked = false;
        Ok(())
    }
}
