use std::time::Duration;

use tracing::debug;

use super::{
    Backend, BackendOptions, Data, DataType, ReadlineOptions, TimeoutGuard, WriteOptions,
    read_echo,
};
use crate::constants::{
    DEFAULT_OPEN_RETRY_TIMES, DEFAULT_TERM_READ, DEFAULT_TERM_WRITE, DEFAULT_TIMEOUT,
    FTDI_VENDOR_ID, MIN_DEVICE_TIMEOUT, OPEN_RETRY_DELAY_MS, STREAM_DRAIN_BLOCK,
};
use crate::cooldown::{CooldownTable, Operation};
use crate::error::{CommError, CommResult};
use crate::interface::serialport::{SerialPortDevice, SerialSettings, list_ports};
use crate::interface::{DeviceInterface, Resource};
use crate::params::ConnParams;
use crate::terminator::{ScanMode, Terminators, read_terms, readline_loop};
use crate::util::retry_wait;

/// FT232 USB-serial bridge, driven through the FTDI virtual COM port.
///
/// The port comes from the VCP driver, so no vendor D2XX library is needed.
/// Compared with [`SerialBackend`](super::SerialBackend):
///
/// - there is no default port; one must be given;
/// - listing only reports ports with the FTDI vendor id;
/// - the port is always held open, `connect_on_operation` is ignored;
/// - a reopen re-applies the last timeout that was set.
///
/// The chip treats a zero timeout as "wait forever", so timeouts are floored
/// at one millisecond.
#[derive(Debug)]
pub struct Ft232Backend {
    iface: Box<dyn DeviceInterface>,
    params: ConnParams,
    term_write: Vec<u8>,
    term_read: Terminators,
    datatype: DataType,
    cooldown: CooldownTable,
    open_retry_times: u32,
    timeout: Duration,
}

impl Ft232Backend {
    pub const KIND: &'static str = "ft232";
    pub const FIELDS: &'static [&'static str] = &[
        "port", "baudrate", "bytesize", "parity", "stopbits", "xonxoff", "rtscts",
    ];

    pub fn default_conn() -> ConnParams {
        ConnParams::new()
            .with("port", None::<&str>)
            .with("baudrate", 9600)
            .with("bytesize", 8)
            .with("parity", "N")
            .with("stopbits", 1)
            .with("xonxoff", 0)
            .with("rtscts", 0)
    }

    pub fn new(params: ConnParams, opts: &BackendOptions) -> CommResult<Self> {
        let settings = SerialSettings::from_params(&params)?;
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT).max(MIN_DEVICE_TIMEOUT);
        let iface = SerialPortDevice::new(settings, timeout);
        Self::with_interface(Box::new(iface), params, opts)
    }

    pub fn with_interface(
        iface: Box<dyn DeviceInterface>,
        params: ConnParams,
        opts: &BackendOptions,
    ) -> CommResult<Self> {
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT).max(MIN_DEVICE_TIMEOUT);
        let mut backend = Ft232Backend {
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
            open_retry_times: opts.open_retry_times.unwrap_or(DEFAULT_OPEN_RETRY_TIMES),
            timeout,
        };
        backend.open()?;
        Ok(backend)
    }

    /// Serial ports belonging to FTDI chips
    pub fn list_resources(desc: bool) -> CommResult<Vec<Resource>> {
        list_ports(desc, Some(FTDI_VENDOR_ID))
    }

    fn read_raw_terms(
        &mut self,
        terms: &Terminators,
        timeout: Option<Duration>,
        error_on_timeout: bool,
    ) -> CommResult<Vec<u8>> {
        let mut this = TimeoutGuard::new(self, timeout)?;
        read_terms(
            |n| this.iface.read(n),
            terms,
            STREAM_DRAIN_BLOCK,
            error_on_timeout,
            ScanMode::Drain,
        )
    }
}

impl Backend for Ft232Backend {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn params(&self) -> &ConnParams {
        &self.params
    }

    /// Re-create the session and re-apply the saved timeout
    fn open(&mut self) -> CommResult<()> {
        if self.iface.is_open() {
            return Ok(());
        }
        let timeout = self.timeout;
        let iface = &mut self.iface;
        retry_wait(
            || {
                iface.close()?;
                iface.open()?;
                iface.set_timeout(timeout)
            },
            self.open_retry_times,
            Duration::from_millis(OPEN_RETRY_DELAY_MS),
        )
        .map_err(|e| CommError::open(Self::KIND, e))?;
        debug!("FT232 backend connected, timeout {:?}", timeout);
        self.cooldown(Operation::Open);
        Ok(())
    }

    fn close(&mut self) -> CommResult<()> {
        if !self.iface.is_open() {
            return Ok(());
        }
        let iface = &mut self.iface;
        retry_wait(
            || iface.close(),
            self.open_retry_times,
            Duration::from_millis(OPEN_RETRY_DELAY_MS),
        )?;
        self.cooldown(Operation::Close);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.iface.is_open()
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> CommResult<()> {
        if let Some(timeout) = timeout {
            self.timeout = timeout.max(MIN_DEVICE_TIMEOUT);
            self.iface.set_timeout(self.timeout)?;
            self.cooldown(Operation::Timeout);
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
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
        let data = match size {
            None => self.read_raw_terms(&Terminators::none(), Some(Duration::ZERO), false)?,
            Some(size) => {
                let data = self.iface.read(size)?;
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
        self.cooldown(Operation::Read);
        Ok(self.datatype.convert(data))
    }

    fn write_with(&mut self, data: &[u8], opts: &WriteOptions) -> CommResult<()> {
        let mut message = data.to_vec();
        message.extend_from_slice(&self.term_write);
        self.iface.write(&message)?;
        self.cooldown(Operation::Write);
        if opts.flush {
            self.iface.flush()?;
            self.cooldown(Operation::Flush);
        }
        read_echo(self, opts)
    }
}
