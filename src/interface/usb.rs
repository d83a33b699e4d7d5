use std::collections::HashMap;
use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext, UsbContext};
use tracing::{debug, trace};

use super::{DeviceInterface, Resource};
use crate::error::{CommError, CommResult};

/// Bulk endpoint pair on a USB device, through libusb.
///
/// The device is the `index`-th one (in enumeration order) with the given
/// vendor and product IDs. Timeouts are passed to libusb per transfer in
/// whole milliseconds.
pub struct UsbDevice {
    vendor_id: u16,
    product_id: u16,
    index: usize,
    endpoint_read: u8,
    endpoint_write: u8,
    handle: Option<DeviceHandle<GlobalContext>>,
    timeout_ms: u64,
}

impl UsbDevice {
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        index: usize,
        endpoint_read: u8,
        endpoint_write: u8,
        timeout: Duration,
    ) -> UsbDevice {
        UsbDevice {
            vendor_id,
            product_id,
            index,
            endpoint_read,
            endpoint_write,
            handle: None,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    fn handle(&self) -> CommResult<&DeviceHandle<GlobalContext>> {
        self.handle.as_ref().ok_or_else(|| {
            CommError::Communication(format!(
                "USB device {:04x}:{:04x} is not open",
                self.vendor_id, self.product_id
            ))
        })
    }

    fn transfer_timeout(&self) -> Duration {
        // libusb treats 0 as "no timeout"
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.product_id))
            .field("index", &self.index)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

impl DeviceInterface for UsbDevice {
    fn open(&mut self) -> CommResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let matching: Vec<_> = rusb::devices()?
            .iter()
            .filter(|d| {
                d.device_descriptor()
                    .map(|desc| {
                        desc.vendor_id() == self.vendor_id && desc.product_id() == self.product_id
                    })
                    .unwrap_or(false)
            })
            .collect();
        let device = matching.get(self.index).ok_or_else(|| {
            CommError::Communication(format!(
                "can't find device with index {}; {} devices found",
                self.index,
                matching.len()
            ))
        })?;

        let handle = device.open()?;
        // Not supported on every platform
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(0)?;
        debug!(
            "Opened USB device {:04x}:{:04x} #{}",
            self.vendor_id, self.product_id, self.index
        );
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> CommResult<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.release_interface(0);
            debug!("Closed USB device {:04x}:{:04x}", self.vendor_id, self.product_id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn read(&mut self, size: usize) -> CommResult<Vec<u8>> {
        let timeout = self.transfer_timeout();
        let handle = self.handle()?;
        let mut buffer = vec![0; size];
        let n = match handle.read_bulk(self.endpoint_read, &mut buffer, timeout) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => 0,
            Err(e) => return Err(e.into()),
        };
        buffer.truncate(n);
        trace!("Received bytes {:?}", buffer);
        Ok(buffer)
    }

    fn write(&mut self, data: &[u8]) -> CommResult<()> {
        let timeout = self.transfer_timeout();
        let handle = self.handle()?;
        let mut sent = 0;
        while sent < data.len() {
            sent += handle.write_bulk(self.endpoint_write, &data[sent..], timeout)?;
        }
        trace!("Sent bytes {:?}", data);
        Ok(())
    }

    fn flush(&mut self) -> CommResult<()> {
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> CommResult<()> {
        self.timeout_ms = timeout.as_millis() as u64;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_millis(self.timeout_ms))
    }
}

/// Whether libusb can be initialised at all on this machine.
pub(crate) fn probe() -> bool {
    rusb::Context::new().is_ok()
}

pub(crate) fn list_devices(desc: bool) -> CommResult<Vec<Resource>> {
    let mut indices: HashMap<(u16, u16), usize> = HashMap::new();
    let mut resources = Vec::new();
    for device in GlobalContext::default().devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let (vendor_id, product_id) = (descriptor.vendor_id(), descriptor.product_id());
        let index = indices.entry((vendor_id, product_id)).or_insert(0);
        resources.push(if desc {
            Resource::UsbDevice {
                vendor_id,
                product_id,
                index: *index,
                bus: device.bus_number(),
                address: device.address(),
            }
        } else {
            Resource::UsbId {
                vendor_id,
                product_id,
                index: *index,
            }
        });
        *index += 1;
    }
    Ok(resources)
}
