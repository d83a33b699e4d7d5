use std::time::Duration;

use super::{
    Backend, BackendOptions, Data, DataType, ReadlineOptions, TimeoutGuard, WriteOptions,
    read_echo,
};
use crate::constants::{DEFAULT_TIMEOUT, USB_MAX_READ_SIZE};
use crate::cooldown::{CooldownTable, Operation};
use crate::error::{CommError, CommResult};
use crate::interface::DeviceInterface;
use crate::params::ConnParams;
use crate::terminator::{ScanMode, Terminators, read_terms, readline_loop};

/// USB library names accepted in the `backend` connection field
pub const USB_LIBRARIES: &[&str] = &["libusb0", "libusb1", "openusb"];

/// Raw USB bulk endpoint backend.
///
/// Endpoints carry packets, so without terminators a read returns the first
/// packet instead of waiting for the timeout. No terminators are configured
/// unless given explicitly.
#[derive(Debug)]
pub struct UsbBackend {
    iface: Box<dyn DeviceInterface>,
    params: ConnParams,
    term_write: Vec<u8>,
    term_read: Terminators,
    datatype: DataType,
    cooldown: CooldownTable,
    check_read_size: bool,
}

impl UsbBackend {
    pub const KIND: &'static str = "pyusb";
    pub const FIELDS: &'static [&'static str] = &[
        "vendorID",
        "productID",
        "index",
        "endpoint_read",
        "endpoint_write",
        "backend",
    ];

    pub fn default_conn() -> ConnParams {
        ConnParams::new()
            .with("vendorID", 0x0000)
            .with("productID", 0x0000)
            .with("index", 0)
            .with("endpoint_read", 0x00)
            .with("endpoint_write", 0x01)
            .with("backend", "libusb1")
    }

    /// Find and claim the device through libusb
    #[cfg(feature = "usb")]
    pub fn new(params: ConnParams, opts: &BackendOptions) -> CommResult<Self> {
        let library = usb_library(&params)?;
        if library != "libusb1" {
            return Err(CommError::open(
                Self::KIND,
                CommError::Unsupported(format!("USB library '{library}' is not available")),
            ));
        }
        let field = |name: &str, max: i64| -> CommResult<i64> {
            let value = params.int_or(name, 0)?;
            if (0..=max).contains(&value) {
                Ok(value)
            } else {
                Err(CommError::Validation(format!("{name} {value} is out of range")))
            }
        };
        let iface = crate::interface::usb::UsbDevice::new(
            field("vendorID", 0xFFFF)? as u16,
            field("productID", 0xFFFF)? as u16,
            field("index", i64::from(u32::MAX))? as usize,
            field("endpoint_read", 0xFF)? as u8,
            field("endpoint_write", 0xFF)? as u8,
            opts.timeout.unwrap_or(DEFAULT_TIMEOUT),
        );
        Self::with_interface(Box::new(iface), params, opts)
    }

    #[cfg(feature = "usb")]
    pub fn list_resources(desc: bool) -> CommResult<Vec<crate::interface::Resource>> {
        crate::interface::usb::list_devices(desc)
    }

    pub fn with_interface(
        iface: Box<dyn DeviceInterface>,
        params: ConnParams,
        opts: &BackendOptions,
    ) -> CommResult<Self> {
        usb_library(&params)?;
        let mut backend = UsbBackend {
            iface,
            params,
            term_write: opts.term_write.clone().unwrap_or_default(),
            term_read: opts.term_read.clone().unwrap_or_default(),
            datatype: opts.datatype,
            cooldown: opts.cooldown_table(),
            check_read_size: opts.check_read_size.unwrap_or(true),
        };
        backend
            .iface
            .set_timeout(opts.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .map_err(|e| CommError::open(Self::KIND, e))?;
        backend.open()?;
        Ok(backend)
    }

    fn read_raw_terms(
        &mut self,
        terms: &Terminators,
        block_size: usize,
        timeout: Option<Duration>,
        error_on_timeout: bool,
    ) -> CommResult<Vec<u8>> {
        let mut this = TimeoutGuard::new(self, timeout)?;
        read_terms(
            |n| this.iface.read(n),
            terms,
            block_size,
            error_on_timeout,
            ScanMode::SingleBlock,
        )
    }
}

fn usb_library(params: &ConnParams) -> CommResult<String> {
    let library = params
        .value("backend")
        .and_then(|v| v.as_str())
        .unwrap_or("libusb1")
        .to_owned();
    if USB_LIBRARIES.contains(&library.as_str()) {
        Ok(library)
    } else {
        Err(CommError::Validation(format!(
            "unknown USB library '{library}', expected one of {}",
            USB_LIBRARIES.join(", ")
        )))
    }
}

impl Backend for UsbBackend {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn params(&self) -> &ConnParams {
        &self.params
    }

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
                let raw = self.read_raw_terms(
                    &terms,
                    USB_MAX_READ_SIZE,
                    opts.timeout,
                    opts.error_on_timeout,
                )?;
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
        let mut raw =
            self.read_raw_terms(terms, USB_MAX_READ_SIZE, opts.timeout, opts.error_on_timeout)?;
        self.cooldown(Operation::Read);
        if opts.remove_term {
            let len = terms.strip(&raw).len();
            raw.truncate(len);
        }
        Ok(self.datatype.convert(raw))
    }

    fn read(&mut self, size: Option<usize>) -> CommResult<Data> {
        let data = match size {
            None => self.read_raw_terms(
                &Terminators::none(),
                USB_MAX_READ_SIZE,
                Some(Duration::ZERO),
                false,
            )?,
            Some(size) => {
                let data = self.iface.read(size)?;
                if self.check_read_size && data.len() != size {
                    return Err(CommError::Validation(format!(
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

    /// Bulk transfers are not buffered; `opts.flush` is ignored
    fn write_with(&mut self, data: &[u8], opts: &WriteOptions) -> CommResult<()> {
        let mut message = data.to_vec();
        message.extend_from_slice(&self.term_write);
        self.iface.write(&message)?;
        self.cooldown(Operation::Write);
        read_echo(self, opts)
    }
}
