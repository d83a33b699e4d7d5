use std::time::Duration;

use super::{
    Backend, BackendOptions, Data, DataType, ReadlineOptions, TimeoutGuard, WriteOptions,
    read_echo,
};
use crate::constants::{DEFAULT_TERM_WRITE, DEFAULT_TIMEOUT, NETWORK_TERM_READ, TCP_DRAIN_BLOCK};
use crate::cooldown::{CooldownTable, Operation};
use crate::error::{CommError, CommResult};
use crate::interface::DeviceInterface;
use crate::interface::tcp::TcpDevice;
use crate::params::ConnParams;
use crate::terminator::{ScanMode, Terminators, read_terms, readline_loop};

/// Split an `"addr:port"` address into its parts. The `port` field is used
/// when the address carries none.
pub(crate) fn split_addr(params: &mut ConnParams) -> CommResult<(String, u16)> {
    let addr = params.require_str("addr")?;
    let parts: Vec<&str> = addr.split(':').collect();
    let (host, port) = match parts.as_slice() {
        [host] => (host.to_string(), params.int_or("port", 80)?),
        [host, port] => {
            let port = port.parse::<i64>().map_err(|_| {
                CommError::Validation(format!("invalid device address: {addr}"))
            })?;
            (host.to_string(), port)
        }
        _ => {
            return Err(CommError::Validation(format!(
                "invalid device address: {addr}"
            )));
        }
    };
    let port = u16::try_from(port)
        .map_err(|_| CommError::Validation(format!("invalid port {port} for {host}")))?;
    params.insert("addr", host.as_str());
    params.insert("port", port);
    Ok((host, port))
}

/// Socket backend.
///
/// Line reads are strict: a missing delimiter at timeout is always an error,
/// partial lines are never returned. Flushing is a no-op.
#[derive(Debug)]
pub struct NetworkBackend {
    iface: Box<dyn DeviceInterface>,
    params: ConnParams,
    term_write: Vec<u8>,
    term_read: Terminators,
    datatype: DataType,
    cooldown: CooldownTable,
}

impl NetworkBackend {
    pub const KIND: &'static str = "network";
    pub const FIELDS: &'static [&'static str] = &["addr", "port"];

    pub fn default_conn() -> ConnParams {
        ConnParams::new().with("addr", "127.0.0.1").with("port", 80)
    }

    pub fn new(mut params: ConnParams, opts: &BackendOptions) -> CommResult<Self> {
        let (host, port) = split_addr(&mut params)?;
        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let iface = TcpDevice::new(host, port, Some(timeout));
        Self::with_interface(Box::new(iface), params, opts)
    }

    pub fn with_interface(
        iface: Box<dyn DeviceInterface>,
        params: ConnParams,
        opts: &BackendOptions,
    ) -> CommResult<Self> {
        let mut backend = NetworkBackend {
            iface,
            params,
            term_write: opts
                .term_write
                .clone()
                .unwrap_or_else(|| DEFAULT_TERM_WRITE.to_vec()),
            term_read: opts
                .term_read
                .clone()
                .unwrap_or_else(|| NETWORK_TERM_READ.into()),
            datatype: opts.datatype,
            cooldown: opts.cooldown_table(),
        };
        backend.open()?;
        backend
            .set_timeout(Some(opts.timeout.unwrap_or(DEFAULT_TIMEOUT)))
            .map_err(|e| CommError::open(Self::KIND, e))?;
        Ok(backend)
    }

    fn recv_delimiter(&mut self, terms: &Terminators, timeout: Option<Duration>) -> CommResult<Vec<u8>> {
        let mut this = TimeoutGuard::new(self, timeout)?;
        read_terms(
            |n| this.iface.read(n),
            terms,
            TCP_DRAIN_BLOCK,
            true,
            ScanMode::Drain,
        )
    }
}

impl Backend for NetworkBackend {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn params(&self) -> &ConnParams {
        &self.params
    }

    /// (Re)connect; an existing connection is dropped first
    fn open(&mut self) -> CommResult<()> {
        self.iface
            .open()
            .map_err(|e| CommError::open(Self::KIND, e))?;
        self.cooldown(Operation::Open);
        Ok(())
    }

    fn close(&mut self) -> CommResult<()> {
        if self.iface.is_open() {
            self.iface.close()?;
            self.cooldown(Operation::Close);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.iface.is_open()
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

    /// `error_on_timeout` is ignored: sockets always read strictly
    fn readline_with(&mut self, opts: &ReadlineOptions) -> CommResult<Data> {
        let terms = self.term_read.clone();
        let line = readline_loop(
            || {
                let raw = self.recv_delimiter(&terms, opts.timeout)?;
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
        let mut raw = self.recv_delimiter(terms, opts.timeout)?;
        self.cooldown(Operation::Read);
        if opts.remove_term {
            let len = terms.strip(&raw).len();
            raw.truncate(len);
        }
        Ok(self.datatype.convert(raw))
    }

    fn read(&mut self, size: Option<usize>) -> CommResult<Data> {
        let data = match size {
            None => {
                let mut this = TimeoutGuard::new(&mut *self, Some(Duration::ZERO))?;
                read_terms(
                    |n| this.iface.read(n),
                    &Terminators::none(),
                    TCP_DRAIN_BLOCK,
                    false,
                    ScanMode::Drain,
                )?
            }
            Some(size) => {
                let data = self.iface.read(size)?;
                if data.len() != size {
                    return Err(CommError::Timeout(format!(
                        "received {} of {} bytes before timeout",
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

    /// `opts.flush` is ignored
    fn write_with(&mut self, data: &[u8], opts: &WriteOptions) -> CommResult<()> {
        let mut message = data.to_vec();
        message.extend_from_slice(&self.term_write);
        self.iface.write(&message)?;
        self.cooldown(Operation::Write);
        read_echo(self, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::memory::MemoryDevice;

    fn backend(dev: &MemoryDevice) -> NetworkBackend {
        NetworkBackend::with_interface(
            Box::new(dev.clone()),
            NetworkBackend::default_conn(),
            &BackendOptions::new(),
        )
        .unwrap()
    }

    #[test]
    fn address_splitting() {
        let mut params = ConnParams::new().with("addr", "192.168.0.5:5025");
        assert_eq!(
            split_addr(&mut params).unwrap(),
            ("192.168.0.5".to_owned(), 5025)
        );
        assert_eq!(params.get("port").and_then(|p| p.as_i64()), Some(5025));

        let mut params = NetworkBackend::default_conn();
        assert_eq!(split_addr(&mut params).unwrap().1, 80);

        let mut params = ConnParams::new().with("addr", "fe80::1:80");
        assert!(matches!(
            split_addr(&mut params),
            Err(CommError::Validation(_))
        ));
    }

    #[test]
    fn readline_is_strict() {
        let dev = MemoryDevice::new();
        let mut b = backend(&dev);
        dev.push(b"no delimiter");
        let err = b
            .readline_with(&ReadlineOptions::default().partial_on_timeout())
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(b.timeout(), Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn readline_uses_crlf() {
        let dev = MemoryDevice::new();
        let mut b = backend(&dev);
        dev.push(b"\r\nVOLT 1.0\r\n");
        assert_eq!(b.readline().unwrap().as_bytes(), b"VOLT 1.0");
    }

    #[test]
    fn fixed_read_is_strict() {
        let dev = MemoryDevice::new();
        let mut b = backend(&dev);
        dev.push(b"ab");
        assert!(b.read(Some(3)).unwrap_err().is_timeout());
    }

    #[test]
    fn write_does_not_flush() {
        let dev = MemoryDevice::new();
        let mut b = backend(&dev);
        b.write(b"MEAS?").unwrap();
        assert_eq!(dev.take_written(), b"MEAS?\r\n");
        assert_eq!(dev.flushes(), 0);
    }
}
