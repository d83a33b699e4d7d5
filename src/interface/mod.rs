//! Transport capability providers.
//!
//! Each transport library is reduced to the handful of operations the
//! backends need. Backends never touch the libraries directly, so any of them
//! can be driven by [`memory::MemoryDevice`] instead of real hardware.

pub mod memory;
pub mod serialport;
pub mod tcp;
#[cfg(feature = "usb")]
pub mod usb;
#[cfg(feature = "visa")]
pub mod visa;

use std::fmt;
use std::time::Duration;

use crate::error::CommResult;

/// A byte-oriented transport session (serial port, socket, USB endpoint pair).
pub trait DeviceInterface: Send + fmt::Debug {
    /// Open the underlying session
    fn open(&mut self) -> CommResult<()>;

    /// Release the underlying session; closing a closed session does nothing
    fn close(&mut self) -> CommResult<()>;

    fn is_open(&self) -> bool;

    /// Read at most `size` bytes. Returns fewer bytes, possibly none, when
    /// the transport timeout expires first.
    fn read(&mut self, size: usize) -> CommResult<Vec<u8>>;

    /// Write all of `data`
    fn write(&mut self, data: &[u8]) -> CommResult<()>;

    /// Flush pending output
    fn flush(&mut self) -> CommResult<()>;

    /// Set the timeout applied to every following read. Zero means
    /// "return what is available right away".
    fn set_timeout(&mut self, timeout: Duration) -> CommResult<()>;

    fn timeout(&self) -> Option<Duration>;

    /// Drive the DTR control line. Transports without one ignore it.
    fn set_dtr(&mut self, level: bool) -> CommResult<()> {
        let _ = level;
        Ok(())
    }
}

/// What an instrument session handles by itself, which differs between
/// VISA implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisaCapabilities {
    /// Separate read and write terminators. Without it a single terminator is
    /// used for both directions.
    pub separate_termination: bool,
    /// Native timeout unit is milliseconds rather than seconds.
    pub timeout_in_millis: bool,
    pub locking: bool,
}

/// An instrument session that frames messages itself.
pub trait VisaSession: Send + fmt::Debug {
    fn capabilities(&self) -> VisaCapabilities;

    fn open(&mut self) -> CommResult<()>;

    fn close(&mut self) -> CommResult<()>;

    /// Read one message, ending with the session's read terminator (or the
    /// end-of-message indicator). Fails with a timeout error when nothing
    /// arrives in time.
    fn read_message(&mut self) -> CommResult<Vec<u8>>;

    /// Read exactly `size` bytes or fail.
    fn read_bytes(&mut self, size: usize) -> CommResult<Vec<u8>>;

    /// Write `data` followed by the session's write terminator.
    fn write_message(&mut self, data: &[u8]) -> CommResult<()>;

    /// Timeout in the session's native unit (see [`VisaCapabilities`]).
    fn set_timeout_native(&mut self, value: f64) -> CommResult<()>;

    fn timeout_native(&self) -> Option<f64>;

    /// Configure terminators. Sessions without separate termination only
    /// look at `read` and use it both ways.
    fn set_termination(&mut self, read: &[u8], write: &[u8]) -> CommResult<()>;

    fn read_termination(&self) -> Vec<u8>;

    /// Lock the resource against other sessions; timeout in native units.
    fn lock(&mut self, timeout: Option<f64>) -> CommResult<()>;

    fn unlock(&mut self) -> CommResult<()>;
}

/// One entry of a resource listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// Plain connection identifier (port name, resource string)
    Address(String),
    /// `(vendor, product, index)` triple usable as USB connection parameters
    UsbId {
        vendor_id: u16,
        product_id: u16,
        index: usize,
    },
    SerialPort {
        name: String,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        serial_number: Option<String>,
        manufacturer: Option<String>,
        product: Option<String>,
    },
    UsbDevice {
        vendor_id: u16,
        product_id: u16,
        index: usize,
        bus: u8,
        address: u8,
    },
    Visa {
        resource: String,
        alias: Option<String>,
    },
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Address(addr) => write!(f, "{addr}"),
            Resource::UsbId {
                vendor_id,
                product_id,
                index,
            } => write!(f, "({vendor_id:#06x}, {product_id:#06x}, {index})"),
            Resource::SerialPort {
                name,
                vendor_id,
                product_id,
                serial_number,
                manufacturer,
                product,
            } => {
                write!(f, "{name}")?;
                if let (Some(vid), Some(pid)) = (vendor_id, product_id) {
                    write!(f, " [{vid:04x}:{pid:04x}]")?;
                }
                for extra in [manufacturer, product, serial_number].into_iter().flatten() {
                    write!(f, " {extra}")?;
                }
                Ok(())
            }
            Resource::UsbDevice {
                vendor_id,
                product_id,
                index,
                bus,
                address,
            } => write!(
                f,
                "({vendor_id:#06x}, {product_id:#06x}, {index}) bus {bus:03} address {address:03}"
            ),
            Resource::Visa { resource, alias } => match alias {
                Some(alias) => write!(f, "{resource} ({alias})"),
                None => write!(f, "{resource}"),
            },
        }
    }
}
