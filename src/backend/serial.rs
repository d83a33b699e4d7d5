use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tracing::{debug, warn};

use super::{
    Backend, BackendOptions, Data, DataType, ReadlineOptions, TimeoutGuard, WriteOptions,
    read_echo,
};
use crate::constants::{
    DEFAULT_OPEN_RETRY_TIMES, DEFAULT_TERM_READ, DEFAULT_TERM_WRITE, DEFAULT_TIMEOUT,
    OPEN_RETRY_DELAY_MS, STREAM_DRAIN_BLOCK,
};
use crate::cooldown::{CooldownTable, Operation};
use crate::error::{CommError, CommResult};
use crate::interface::serialport::{SerialPortDevice, SerialSettings, list_ports};
use crate::interface::{DeviceInterface, Resource};
use crate::params::ConnParams;
use crate::terminator::{ScanMode, Terminators, read_terms, readline_loop};
use crate::util::retry_wait;

/// Serial port backend.
///
/// With `connect_on_operation` the port stays closed and is only opened for
/// the duration of each operation, or of a batch of operations wrapped in
/// [`SerialBackend::single_op`]. This lets several processes share a port.
/// Opening such a backend only marks it open and waits out the open
/// cooldown; each physical connection waits it out again.
#[derive(Debug)]
pub struct SerialBackend {
    iface: Box<dyn DeviceInterface>,
    params: ConnParams,
    term_write: Vec<u8>,
    term_read: Terminators,
    datatype: DataType,
    cooldown: CooldownTable,
    connect_on_operation: bool,
    open_retry_times: u32,
    opened: bool,
    op_depth: usize,
}

impl SerialBackend {
    pub const KIND: &'static str = "serial";
    pub const FIELDS: &'static [&'static str] = &[
        "port", "baudrate", "bytesize", "parity", "stopbits", "xonxoff", "rtscts", "dsrdtr",
    ];

    pub fn default_conn() -> ConnParams {
        ConnParams::new()
            .with("port", "COM1")
            .with("baudrate", 19200)
            .with("bytesize", 8)
            .with("parity", "N")
            .with("stopbits", 1)
            .with("xonxoff", 0)
            .with("rtscts", 0)
            .with("dsrdtr", 0)
    }

    /// Build a backend on a system serial port and open it (unless
    /// connecting on operation).
    pub fn new(params: ConnParams, opts: &BackendOptions) -> CommResult<Self> {
        let settings = SerialSettings::from_params(&params)?;
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let iface = SerialPortDevice::new(settings, timeout);
        Self::with_interface(Box::new(iface), params, opts)
    }

    /// Build a backend over an arbitrary byte stream session.
    pub fn with_interface(
        mut iface: Box<dyn DeviceInterface>,
        params: ConnParams,
        opts: &BackendOptions,
    ) -> CommResult<Self> {
        if opts.no_dtr {
            if let Err(e) = iface.set_dtr(false) {
                warn!("Cannot set DTR for an unconnected device: {}", e);
            }
        }
        let mut backend = SerialBackend {
            iface,
            params,
            term_write: opts
                .term_write
                .clone()
                .unwrap_or_else(|| DEFAULT_TERM_WRITE.to_vec()),
            term_read: opts
                .term_read
                .clone()
                .unwrap_or_else(|| DEFAULT_TERM_READ.into()),
            datatype: opts.datatype,
            cooldown: opts.cooldown_table(),
            connect_on_operation: opts.connect_on_operation,
            open_retry_times: opts.open_retry_times.unwrap_or(DEFAULT_OPEN_RETRY_TIMES),
            opened: false,
            op_depth: 0,
        };
        // A logical open still waits out the open cooldown
        if backend.connect_on_operation {
            backend.cooldown(Operation::Open);
        } else {
            backend.open_port()?;
        }
        backend.opened = true;
        backend
            .set_timeout(Some(opts.timeout.unwrap_or(DEFAULT_TIMEOUT)))
            .map_err(|e| CommError::open(Self::KIND, e))?;
        Ok(backend)
    }

    pub fn list_resources(desc: bool) -> CommResult<Vec<Resource>> {
        list_ports(desc, None)
    }

    /// Keep the port open until the returned guard is dropped.
    ///
    /// Only has an effect with `connect_on_operation`: the first (outermost)
    /// guard opens the port, the last one to be dropped closes it. Guards
    /// nest, so operations performed through the guard reuse the connection.
    pub fn single_op(&mut self) -> CommResult<SingleOp<'_>> {
        let managed = self.connect_on_operation;
        if managed {
            if self.op_depth == 0 {
                self.open_port()?;
            }
            self.op_depth += 1;
        }
        Ok(SingleOp {
            backend: self,
            managed,
        })
    }

    fn open_port(&mut self) -> CommResult<()> {
        let times = self.open_retry_times;
        let iface = &mut self.iface;
        retry_wait(
            || iface.open(),
            times,
            Duration::from_millis(OPEN_RETRY_DELAY_MS),
        )
        .map_err(|e| CommError::open(Self::KIND, e))?;
        debug!("Serial backend connected");
        self.cooldown(Operation::Open);
        Ok(())
    }

    fn close_port(&mut self) -> CommResult<()> {
        let times = self.open_retry_times;
        let iface = &mut self.iface;
        retry_wait(
            || iface.close(),
            times,
            Duration::from_millis(OPEN_RETRY_DELAY_MS),
        )?;
        debug!("Serial backend disconnected");
        self.cooldown(Operation::Close);
        Ok(())
    }

    fn read_raw_terms(
        &mut self,
        terms: &Terminators,
        timeout: Option<Duration>,
        error_on_timeout: bool,
    ) -> CommResult<Vec<u8>> {
        let mut op = self.single_op()?;
        let mut this = TimeoutGuard::new(&mut *op, timeout)?;
        read_terms(
            |n| this.iface.read(n),
            terms,
            STREAM_DRAIN_BLOCK,
            error_on_timeout,
            ScanMode::Drain,
        )
    }
}

impl Backend for SerialBackend {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn params(&self) -> &ConnParams {
        &self.params
    }

    fn open(&mut self) -> CommResult<()> {
        if !self.opened {
            if self.connect_on_operation {
                self.cooldown(Operation::Open);
            } else {
                self.open_port()?;
            }
        }
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> CommResult<()> {
        if !self.connect_on_operation && self.opened {
            self.close_port()?;
        }
        self.opened = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> CommResult<()> {
        if let Some(timeout) = timeout {
            self.iface.set_timeout(timeout)?;
            self.cooldown(Operation::Timeout);
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.iface.timeout()
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
        let terms = self.term_read.clone();
        let line = readline_loop(
            || {
                let raw = self.read_raw_terms(&terms, opts.timeout, opts.error_on_timeout)?;
                self.cooldown(Operation::Read);
                Ok(raw)
            },
            &terms,
            opts.remove_term,
            opts.skip_empty,
        )?;
        Ok(self.datatype.convert(line))
    }

    fn read_multichar_term(
        &mut self,
        terms: &Terminators,
        opts: &ReadlineOptions,
    ) -> CommResult<Data> {
        let mut raw = self.read_raw_terms(terms, opts.timeout, opts.error_on_timeout)?;
        self.cooldown(Operation::Read);
        if opts.remove_term {
            let len = terms.strip(&raw).len();
            raw.truncate(len);
        }
        Ok(self.datatype.convert(raw))
    }

    fn read(&mut self, size: Option<usize>) -> CommResult<Data> {
        let mut op = self.single_op()?;
        let data = match size {
            None => op.read_raw_terms(&Terminators::none(), Some(Duration::ZERO), false)?,
            Some(size) => {
                let data = op.iface.read(size)?;
                if data.len() != size {
                    return Err(CommError::Communication(format!(
                        "read returned less than expected: {} instead of {}",
                        data.len(),
                        size
                    )));
                }
                data
            }
        };
        op.cooldown(Operation::Read);
        Ok(op.datatype.convert(data))
    }

    fn write_with(&mut self, data: &[u8], opts: &WriteOptions) -> CommResult<()> {
        let mut op = self.single_op()?;
        let mut message = data.to_vec();
        message.extend_from_slice(&op.term_write);
        op.iface.write(&message)?;
        op.cooldown(Operation::Write);
        if opts.flush {
            op.iface.flush()?;
            op.cooldown(Operation::Flush);
        }
        read_echo(&mut *op, opts)
    }
}

/// Connection scope returned by [`SerialBackend::single_op`].
pub struct SingleOp<'a> {
    backend: &'a mut SerialBackend,
    managed: bool,
}

impl Deref for SingleOp<'_> {
    type Target = SerialBackend;

    fn deref(&self) -> &SerialBackend {
        self.backend
    }
}

impl DerefMut for SingleOp<'_> {
    fn deref_mut(&mut self) -> &mut SerialBackend {
        self.backend
    }
}

impl Drop for SingleOp<'_> {
    fn drop(&mut self) {
        if !self.managed {
            return;
        }
        self.backend.op_depth = self.backend.op_depth.saturating_sub(1);
        if self.backend.op_depth == 0 {
            if let Err(e) = self.backend.close_port() {
                warn!("Failed to close serial port after operation: {}", e);
            }
        }
    }
}
