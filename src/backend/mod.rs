//! The operation contract shared by every communication backend.
//!
//! A backend owns one opened transport session together with its
//! terminators, default timeout, cooldown table and output datatype. The
//! variants live in the submodules; everything that is policy rather than
//! transport (echo draining, `ask`, scoped timeouts and locks) is provided
//! here once.

pub mod ft232;
pub mod network;
pub mod serial;
pub mod usb;
pub mod visa;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::cooldown::{CooldownTable, Operation};
use crate::error::{CommError, CommResult};
use crate::params::ConnParams;
use crate::terminator::Terminators;

pub use ft232::Ft232Backend;
pub use network::NetworkBackend;
pub use serial::{SerialBackend, SingleOp};
pub use usb::UsbBackend;
pub use visa::VisaBackend;

/// Shape of the data returned by read operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataType {
    /// Raw bytes
    Bytes,
    /// Decoded text
    Str,
    /// Whatever the transport produces, which is raw bytes
    #[default]
    Auto,
}

impl DataType {
    pub fn convert(self, data: Vec<u8>) -> Data {
        match self {
            DataType::Str => Data::Text(String::from_utf8_lossy(&data).into_owned()),
            DataType::Bytes | DataType::Auto => Data::Bytes(data),
        }
    }
}

impl FromStr for DataType {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bytes" => Ok(DataType::Bytes),
            "str" => Ok(DataType::Str),
            "auto" => Ok(DataType::Auto),
            other => Err(CommError::Validation(format!(
                "datatype must be one of 'bytes', 'str' or 'auto', got '{other}'"
            ))),
        }
    }
}

/// Result of a read operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Bytes(Vec<u8>),
    Text(String),
}

impl Data {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Data::Bytes(b) => b,
            Data::Text(s) => s.as_bytes(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Data::Bytes(b) => b,
            Data::Text(s) => s.into_bytes(),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Data::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Data::Text(s) => s.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Options of a single line read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadlineOptions {
    /// Strip the (longest) terminator from the result
    pub remove_term: bool,
    /// Timeout for this read only; `None` keeps the backend timeout
    pub timeout: Option<Duration>,
    /// Skip lines that are empty once the terminator is removed
    pub skip_empty: bool,
    /// Fail on timeout instead of returning the incomplete line
    pub error_on_timeout: bool,
}

impl Default for ReadlineOptions {
    fn default() -> Self {
        ReadlineOptions {
            remove_term: true,
            timeout: None,
            skip_empty: true,
            error_on_timeout: true,
        }
    }
}

impl ReadlineOptions {
    pub fn raw() -> Self {
        ReadlineOptions {
            remove_term: false,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn keep_empty(mut self) -> Self {
        self.skip_empty = false;
        self
    }

    pub fn partial_on_timeout(mut self) -> Self {
        self.error_on_timeout = false;
        self
    }
}

/// Options of a single write
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteOptions {
    pub flush: bool,
    /// Read back the echo of the written line
    pub read_echo: bool,
    pub read_echo_delay: Duration,
    pub read_echo_lines: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            flush: true,
            read_echo: false,
            read_echo_delay: Duration::ZERO,
            read_echo_lines: 1,
        }
    }
}

impl WriteOptions {
    pub fn with_echo(lines: usize) -> Self {
        WriteOptions {
            read_echo: true,
            read_echo_lines: lines,
            ..Self::default()
        }
    }

    pub fn echo_delay(mut self, delay: Duration) -> Self {
        self.read_echo_delay = delay;
        self
    }

    pub fn no_flush(mut self) -> Self {
        self.flush = false;
        self
    }
}

/// Construction options understood by the backends. Unset fields take the
/// defaults of the backend kind; options a kind has no use for are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendOptions {
    pub timeout: Option<Duration>,
    pub term_write: Option<Vec<u8>>,
    pub term_read: Option<Terminators>,
    pub datatype: DataType,
    /// Keep the port closed between operations (serial only)
    pub connect_on_operation: bool,
    pub open_retry_times: Option<u32>,
    /// Deassert DTR before opening, which stops boards that reset on connect
    pub no_dtr: bool,
    /// Actually lock VISA sessions in `lock`/`unlock`
    pub do_lock: Option<bool>,
    /// Fail fixed-size USB reads that return fewer bytes
    pub check_read_size: Option<bool>,
    pub cooldown: Option<CooldownTable>,
}

impl BackendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn term_write(mut self, term: impl AsRef<[u8]>) -> Self {
        self.term_write = Some(term.as_ref().to_vec());
        self
    }

    pub fn term_read(mut self, terms: impl Into<Terminators>) -> Self {
        self.term_read = Some(terms.into());
        self
    }

    pub fn datatype(mut self, datatype: DataType) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn connect_on_operation(mut self, enable: bool) -> Self {
        self.connect_on_operation = enable;
        self
    }

    pub fn open_retry_times(mut self, times: u32) -> Self {
        self.open_retry_times = Some(times);
        self
    }

    pub fn no_dtr(mut self, enable: bool) -> Self {
        self.no_dtr = enable;
        self
    }

    pub fn do_lock(mut self, enable: bool) -> Self {
        self.do_lock = Some(enable);
        self
    }

    pub fn check_read_size(mut self, enable: bool) -> Self {
        self.check_read_size = Some(enable);
        self
    }

    pub fn cooldown(mut self, table: CooldownTable) -> Self {
        self.cooldown = Some(table);
        self
    }

    pub(crate) fn cooldown_table(&self) -> CooldownTable {
        self.cooldown.clone().unwrap_or_default()
    }
}

/// A live, opened communication channel to one device.
///
/// All operations block, up to the configured timeout. Mid-session failures
/// are reported as [`CommError`] values for which
/// [`CommError::is_communication`] holds, whatever the transport.
pub trait Backend: Send + fmt::Debug {
    /// Registry name of the backend kind
    fn kind(&self) -> &str;

    /// Normalized connection parameters the backend was built from
    fn params(&self) -> &ConnParams;

    fn open(&mut self) -> CommResult<()>;

    /// Close the connection; closing a closed backend does nothing
    fn close(&mut self) -> CommResult<()>;

    /// Last known connection state, not a live probe
    fn is_open(&self) -> bool;

    /// Lock the device against other processes. Backends that cannot lock
    /// do nothing.
    fn lock(&mut self, timeout: Option<Duration>) -> CommResult<()> {
        let _ = timeout;
        Ok(())
    }

    fn unlock(&mut self) -> CommResult<()> {
        Ok(())
    }

    /// Set the operation timeout; `None` leaves it unchanged
    fn set_timeout(&mut self, timeout: Option<Duration>) -> CommResult<()>;

    /// Current operation timeout; `None` means no finite timeout
    fn timeout(&self) -> Option<Duration>;

    fn datatype(&self) -> DataType;

    fn cooldowns(&self) -> &CooldownTable;

    fn cooldowns_mut(&mut self) -> &mut CooldownTable;

    /// Read a single line, up to one of the read terminators
    fn readline_with(&mut self, opts: &ReadlineOptions) -> CommResult<Data>;

    /// Read a single line ending with one of `terms` instead of the
    /// configured read terminators. `skip_empty` is not used.
    fn read_multichar_term(
        &mut self,
        terms: &Terminators,
        opts: &ReadlineOptions,
    ) -> CommResult<Data>;

    /// With `size`, read exactly that many bytes (the timeout applies);
    /// without, return whatever is available right away.
    fn read(&mut self, size: Option<usize>) -> CommResult<Data>;

    /// Write `data` followed by the write terminator
    fn write_with(&mut self, data: &[u8], opts: &WriteOptions) -> CommResult<()>;

    fn readline(&mut self) -> CommResult<Data> {
        self.readline_with(&ReadlineOptions::default())
    }

    fn readlines(&mut self, count: usize, opts: &ReadlineOptions) -> CommResult<Vec<Data>> {
        (0..count).map(|_| self.readline_with(opts)).collect()
    }

    /// Discard pending input; returns the number of bytes dropped
    fn flush_read(&mut self) -> CommResult<usize> {
        Ok(self.read(None)?.len())
    }

    fn write(&mut self, data: &[u8]) -> CommResult<()> {
        self.write_with(data, &WriteOptions::default())
    }

    /// Write `query`, wait `delay`, then read one line (or everything
    /// available when `read_all` is set).
    fn ask(&mut self, query: &[u8], delay: Option<Duration>, read_all: bool) -> CommResult<Data> {
        self.write(query)?;
        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            std::thread::sleep(delay);
        }
        if read_all {
            self.read(None)
        } else {
            self.readline()
        }
    }

    /// Set the cooldown of an operation kind in seconds (`"all"` resets the table)
    fn setup_cooldown(&mut self, kind: &str, seconds: f64) -> CommResult<()> {
        self.cooldowns_mut().setup(kind, seconds)
    }

    fn cooldown(&self, op: Operation) {
        self.cooldowns().wait(op);
    }
}

/// Wait and drain echoed lines after a write.
pub(crate) fn read_echo<B: Backend + ?Sized>(backend: &mut B, opts: &WriteOptions) -> CommResult<()> {
    if !opts.read_echo_delay.is_zero() {
        std::thread::sleep(opts.read_echo_delay);
    }
    if opts.read_echo {
        for _ in 0..opts.read_echo_lines {
            backend.readline()?;
        }
    }
    Ok(())
}

/// Overrides the timeout of a backend for the guard's lifetime.
///
/// The previous timeout is restored on drop, including when the guarded code
/// bails out with `?`. Nothing is touched when the requested timeout is
/// `None` or equal to the current one.
pub struct TimeoutGuard<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
    restore: Option<Option<Duration>>,
}

impl<'a, B: Backend + ?Sized> TimeoutGuard<'a, B> {
    pub fn new(backend: &'a mut B, timeout: Option<Duration>) -> CommResult<Self> {
        let mut restore = None;
        if let Some(timeout) = timeout {
            let current = backend.timeout();
            if current != Some(timeout) {
                backend.set_timeout(Some(timeout))?;
                restore = Some(current);
            }
        }
        Ok(TimeoutGuard { backend, restore })
    }
}

impl<B: Backend + ?Sized> Deref for TimeoutGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
    }
}

impl<B: Backend + ?Sized> DerefMut for TimeoutGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend
    }
}

impl<B: Backend + ?Sized> Drop for TimeoutGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            if let Err(e) = self.backend.set_timeout(previous) {
                warn!("Failed to restore timeout {:?}: {}", previous, e);
            }
        }
    }
}

/// Holds the backend lock for the guard's lifetime.
pub struct LockGuard<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
}

impl<'a, B: Backend + ?Sized> LockGuard<'a, B> {
    pub fn new(backend: &'a mut B, timeout: Option<Duration>) -> CommResult<Self> {
        backend.lock(timeout)?;
        Ok(LockGuard { backend })
    }
}

impl<B: Backend + ?Sized> Deref for LockGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.backend
    }
}

impl<B: Backend + ?Sized> DerefMut for LockGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend
    }
}

impl<B: Backend + ?Sized> Drop for LockGuard<'_, B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.unlock() {
            warn!("Failed to unlock {} backend: {}", self.backend.kind(), e);
        }
    }
}

/// Convert a timeout in (possibly fractional) seconds, as found in
/// configuration files and on the command line.
pub fn seconds(value: f64) -> CommResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| CommError::Validation(format!("invalid timeout {value} s")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datatype_conversion() {
        assert_eq!(DataType::Str.convert(b"ok".to_vec()), Data::Text("ok".into()));
        assert_eq!(DataType::Auto.convert(b"ok".to_vec()), Data::Bytes(b"ok".to_vec()));
        assert_eq!("bytes".parse::<DataType>().unwrap(), DataType::Bytes);
        assert!("text".parse::<DataType>().is_err());
    }

    #[test]
    fn data_views() {
        let data = Data::Bytes(b"12.5".to_vec());
        assert_eq!(data.to_text(), "12.5");
        assert_eq!(data.len(), 4);
        assert!(!data.is_empty());
        assert_eq!(Data::Text("x".into()).into_bytes(), b"x");
    }

    #[test]
    fn option_builders() {
        let opts = ReadlineOptions::raw()
            .with_timeout(Duration::from_millis(5))
            .keep_empty()
            .partial_on_timeout();
        assert!(!opts.remove_term && !opts.skip_empty && !opts.error_on_timeout);
        assert_eq!(opts.timeout, Some(Duration::from_millis(5)));

        let w = WriteOptions::with_echo(2).no_flush();
        assert!(w.read_echo && !w.flush);
        assert_eq!(w.read_echo_lines, 2);

        let b = BackendOptions::new().term_read(vec!["\r", "\n"]).no_dtr(true);
        assert_eq!(b.term_read.unwrap().as_slice().len(), 2);
        assert!(b.no_dtr);
    }

    #[test]
    fn seconds_rejects_negative() {
        assert_eq!(seconds(0.5).unwrap(), Duration::from_millis(500));
        assert!(seconds(-1.0).is_err());
    }
}
