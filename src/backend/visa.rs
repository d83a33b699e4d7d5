use std::time::Duration;

use tracing::debug;

use super::{
    Backend, BackendOptions, Data, DataType, ReadlineOptions, TimeoutGuard, WriteOptions,
    read_echo,
};
use crate::constants::{
    DEFAULT_TERM_READ, DEFAULT_TERM_WRITE, DEFAULT_TIMEOUT, VISA_DRAIN_TIMEOUT,
};
use crate::cooldown::{CooldownTable, Operation};
use crate::error::{CommError, CommResult};
use crate::interface::{VisaCapabilities, VisaSession};
use crate::params::ConnParams;
use crate::terminator::{ScanMode, Terminators, read_terms, readline_loop};

/// Instrument session backend (VISA / GPIB / USBTMC resources).
///
/// Sessions with separate read and write terminators handle framing
/// themselves. Older sessions know a single terminator, which then has to be
/// the tail of the write terminator; the rest of the write terminator is
/// appended here.
#[derive(Debug)]
pub struct VisaBackend {
    session: Box<dyn VisaSession>,
    caps: VisaCapabilities,
    params: ConnParams,
    term_write: Vec<u8>,
    datatype: DataType,
    cooldown: CooldownTable,
    do_lock: bool,
    opened: bool,
    timeout: Option<Duration>,
}

impl VisaBackend {
    pub const KIND: &'static str = "visa";
    pub const FIELDS: &'static [&'static str] = &["addr"];

    pub fn default_conn() -> ConnParams {
        ConnParams::new().with("addr", None::<&str>)
    }

    /// Open a resource through the system VISA library
    #[cfg(feature = "visa")]
    pub fn new(params: ConnParams, opts: &BackendOptions) -> CommResult<Self> {
        let resource = params.require_str("addr")?;
        let session = crate::interface::visa::VisaInstrument::new(resource)
            .map_err(|e| CommError::open(Self::KIND, e))?;
        Self::with_session(Box::new(session), params, opts)
    }

    #[cfg(feature = "visa")]
    pub fn list_resources(desc: bool) -> CommResult<Vec<crate::interface::Resource>> {
        crate::interface::visa::list_resources(desc)
    }

    pub fn with_session(
        mut session: Box<dyn VisaSession>,
        params: ConnParams,
        opts: &BackendOptions,
    ) -> CommResult<Self> {
        let caps = session.capabilities();
        let term_write = opts
            .term_write
            .clone()
            .unwrap_or_else(|| DEFAULT_TERM_WRITE.to_vec());
        let term_read = match &opts.term_read {
            None => DEFAULT_TERM_READ.to_vec(),
            Some(terms) => match terms.as_slice() {
                [] => Vec::new(),
                [term] => term.clone(),
                _ => {
                    return Err(CommError::Validation(
                        "VISA sessions accept a single read terminator".to_owned(),
                    ));
                }
            },
        };

        let local_write = if caps.separate_termination {
            session.set_termination(&term_read, &term_write)?;
            Vec::new()
        } else {
            if !term_write.ends_with(&term_read) {
                return Err(CommError::Validation(format!(
                    "session uses one terminator for both directions; write terminator {:?} must end with read terminator {:?}",
                    term_write, term_read
                )));
            }
            session.set_termination(&term_read, &term_read)?;
            term_write[..term_write.len() - term_read.len()].to_vec()
        };

        session.open().map_err(|e| CommError::open(Self::KIND, e))?;
        let mut backend = VisaBackend {
            session,
            caps,
            params,
            term_write: local_write,
            datatype: opts.datatype,
            cooldown: opts.cooldown_table(),
            do_lock: opts.do_lock.unwrap_or(false),
            opened: true,
            timeout: None,
        };
        backend.cooldown(Operation::Open);
        backend
            .set_timeout(Some(opts.timeout.unwrap_or(DEFAULT_TIMEOUT)))
            .map_err(|e| CommError::open(Self::KIND, e))?;
        Ok(backend)
    }

    fn native_timeout(&self, timeout: Duration) -> f64 {
        if self.caps.timeout_in_millis {
            timeout.as_secs_f64() * 1000.
        } else {
            timeout.as_secs_f64()
        }
    }

    fn read_message(&mut self, error_on_timeout: bool) -> CommResult<Vec<u8>> {
        match self.session.read_message() {
            Err(e) if e.is_timeout() && !error_on_timeout => Ok(Vec::new()),
            result => result,
        }
    }
}

impl Backend for VisaBackend {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn params(&self) -> &ConnParams {
        &self.params
    }

    fn open(&mut self) -> CommResult<()> {
        self.session
            .open()
            .map_err(|e| CommError::open(Self::KIND, e))?;
        self.opened = true;
        self.cooldown(Operation::Open);
        Ok(())
    }

    fn close(&mut self) -> CommResult<()> {
        if self.opened {
            self.session.close()?;
            self.opened = false;
            self.cooldown(Operation::Close);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    fn lock(&mut self, timeout: Option<Duration>) -> CommResult<()> {
        if !self.do_lock {
            return Ok(());
        }
        if !self.caps.locking {
            return Err(CommError::Unsupported(
                "this VISA session does not support locking".to_owned(),
            ));
        }
        let native = timeout.map(|t| self.native_timeout(t));
        self.session.lock(native)?;
        debug!("Locked VISA resource {}", self.params);
        Ok(())
    }

    fn unlock(&mut self) -> CommResult<()> {
        if !self.do_lock {
            return Ok(());
        }
        if !self.caps.locking {
            return Err(CommError::Unsupported(
                "this VISA session does not support locking".to_owned(),
            ));
        }
        self.session.unlock()
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> CommResult<()> {
        if let Some(timeout) = timeout {
            let native = self.native_timeout(timeout);
            self.session.set_timeout_native(native)?;
            self.timeout = Some(timeout);
            self.cooldown(Operation::Timeout);
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn datatype(&self) -> DataType {
        self.datatype
    }

    fn cooldowns(&self) -> &CooldownTable {
        &self.cooldown
    }

    fn cooldowns_mut(&mut self) -> &mut CooldownTable {
        &mut self.cooldown
    }

    fn readline_with(&mut self, opts: &ReadlineOptions) -> CommResult<Data> {
        let terms = Terminators::new([self.session.read_termination()]);
        let line = {
            let mut this = TimeoutGuard::new(&mut *self, opts.timeout)?;
            readline_loop(
                || this.read_message(opts.error_on_timeout),
                &terms,
                opts.remove_term,
                opts.skip_empty,
            )?
        };
        self.cooldown(Operation::Read);
        Ok(self.datatype.convert(line))
    }

    fn read_multichar_term(
        &mut self,
        terms: &Terminators,
        opts: &ReadlineOptions,
    ) -> CommResult<Data> {
        let mut raw = {
            let mut this = TimeoutGuard::new(&mut *self, opts.timeout)?;
            read_terms(
                |n| match this.session.read_bytes(n) {
                    Err(e) if e.is_timeout() => Ok(Vec::new()),
                    result => result,
                },
                terms,
                1,
                opts.error_on_timeout,
                ScanMode::Drain,
            )?
        };
        self.cooldown(Operation::Read);
        if opts.remove_term {
            let len = terms.strip(&raw).len();
            raw.truncate(len);
        }
        Ok(self.datatype.convert(raw))
    }

    fn read(&mut self, size: Option<usize>) -> CommResult<Data> {
        let data = match size {
            Some(size) => self.session.read_bytes(size)?,
            None => {
                let mut this = TimeoutGuard::new(&mut *self, Some(VISA_DRAIN_TIMEOUT))?;
                let mut data = Vec::new();
                loop {
                    match this.session.read_message() {
                        Ok(chunk) => data.extend_from_slice(&chunk),
                        Err(e) if e.is_timeout() => break,
                        Err(e) => return Err(e),
                    }
                }
                data
            }
        };
        self.cooldown(Operation::Read);
        Ok(self.datatype.convert(data))
    }

    /// Flushing is left to the session
    fn write_with(&mut self, data: &[u8], opts: &WriteOptions) -> CommResult<()> {
        let mut message = data.to_vec();
        message.extend_from_slice(&self.term_write);
        self.session.write_message(&message)?;
        self.cooldown(Operation::Write);
        read_echo(self, opts)
    }
}
