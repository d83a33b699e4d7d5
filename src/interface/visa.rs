use std::ffi::CString;
use std::io::{Read, Write};
use std::time::Duration;

use tracing::{debug, trace};
use visa_rs::prelude::*;

use super::{Resource, VisaCapabilities, VisaSession};
use crate::error::{CommError, CommResult};

/// Instrument session opened through the vendor VISA library.
///
/// Terminators are handled on this side of the library boundary, so read
/// and write terminators may differ. Timeouts are native milliseconds.
pub struct VisaInstrument {
    resource: String,
    rm: DefaultRM,
    instr: Option<Instrument>,
    timeout_ms: Option<f64>,
    read_term: Vec<u8>,
    write_term: Vec<u8>,
}

fn visa_string(s: &str) -> CommResult<VisaString> {
    let c_string = CString::new(s)
        .map_err(|e| CommError::Validation(format!("invalid VISA resource '{s}': {e}")))?;
    Ok(VisaString::from(c_string))
}

fn is_visa_timeout(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::TimedOut || e.to_string().contains("TMO")
}

impl VisaInstrument {
    pub fn new(resource: impl Into<String>) -> CommResult<VisaInstrument> {
        Ok(VisaInstrument {
            resource: resource.into(),
            rm: DefaultRM::new()?,
            instr: None,
            timeout_ms: None,
            read_term: Vec::new(),
            write_term: Vec::new(),
        })
    }

    fn instr(&self) -> CommResult<&Instrument> {
        self.instr.as_ref().ok_or_else(|| {
            CommError::Communication(format!("VISA resource {} is not open", self.resource))
        })
    }

    fn apply_timeout(&self) -> CommResult<()> {
        if let (Some(instr), Some(ms)) = (self.instr.as_ref(), self.timeout_ms) {
            let attr = attribute::AttrTmoValue::new_checked(ms.round() as _).ok_or_else(|| {
                CommError::Validation(format!("VISA timeout {ms} ms is out of range"))
            })?;
            instr.set_attr(attr)?;
        }
        Ok(())
    }

    fn read_byte(&self) -> CommResult<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.instr()?.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_visa_timeout(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for VisaInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisaInstrument")
            .field("resource", &self.resource)
            .field("open", &self.instr.is_some())
            .finish()
    }
}

impl VisaSession for VisaInstrument {
    fn capabilities(&self) -> VisaCapabilities {
        VisaCapabilities {
            separate_termination: true,
            timeout_in_millis: true,
            locking: true,
        }
    }

    fn open(&mut self) -> CommResult<()> {
        if self.instr.is_some() {
            return Ok(());
        }
        let resource = visa_string(&self.resource)?;
        let instr = self
            .rm
            .open(&resource, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)?;
        debug!("Opened VISA resource {}", self.resource);
        self.instr = Some(instr);
        self.apply_timeout()
    }

    fn close(&mut self) -> CommResult<()> {
        if self.instr.take().is_some() {
            debug!("Closed VISA resource {}", self.resource);
        }
        Ok(())
    }

    fn read_message(&mut self) -> CommResult<Vec<u8>> {
        let mut message = Vec::new();
        loop {
            match self.read_byte()? {
                Some(byte) => {
                    message.push(byte);
                    if !self.read_term.is_empty() && message.ends_with(&self.read_term) {
                        break;
                    }
                }
                None if message.is_empty() => {
                    return Err(CommError::Timeout(format!(
                        "no message from {} before timeout",
                        self.resource
                    )));
                }
                None => break,
            }
        }
        trace!("Received bytes {:?}", message);
        Ok(message)
    }

    fn read_bytes(&mut self, size: usize) -> CommResult<Vec<u8>> {
        let mut buffer = vec![0; size];
        let mut filled = 0;
        while filled < size {
            match self.instr()?.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if is_visa_timeout(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if filled < size {
            return Err(CommError::Timeout(format!(
                "read returned less than expected: {filled} instead of {size}"
            )));
        }
        Ok(buffer)
    }

    fn write_message(&mut self, data: &[u8]) -> CommResult<()> {
        let mut message = data.to_vec();
        message.extend_from_slice(&self.write_term);
        let mut instr = self.instr()?;
        instr.write_all(&message)?;
        trace!("Sent bytes {:?}", message);
        Ok(())
    }

    fn set_timeout_native(&mut self, value: f64) -> CommResult<()> {
        self.timeout_ms = Some(value);
        self.apply_timeout()
    }

    fn timeout_native(&self) -> Option<f64> {
        self.timeout_ms
    }

    fn set_termination(&mut self, read: &[u8], write: &[u8]) -> CommResult<()> {
        self.read_term = read.to_vec();
        self.write_term = write.to_vec();
        Ok(())
    }

    fn read_termination(&self) -> Vec<u8> {
        self.read_term.clone()
    }

    fn lock(&mut self, timeout: Option<f64>) -> CommResult<()> {
        let timeout = timeout
            .map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0))
            .unwrap_or(TIMEOUT_INFINITE);
        self.instr()?.lock_exclusive(timeout)?;
        Ok(())
    }

    fn unlock(&mut self) -> CommResult<()> {
        self.instr()?.unlock()?;
        Ok(())
    }
}

/// Whether a VISA resource manager can be created on this machine.
pub(crate) fn probe() -> bool {
    DefaultRM::new().is_ok()
}

pub(crate) fn list_resources(desc: bool) -> CommResult<Vec<Resource>> {
    let rm = DefaultRM::new()?;
    let mut list = rm.find_res_list(&visa_string("?*::INSTR")?)?;
    let mut resources = Vec::new();
    while let Some(found) = list.find_next()? {
        let resource = found.to_string();
        resources.push(if desc {
            Resource::Visa {
                resource,
                alias: None,
            }
        } else {
            Resource::Address(resource)
        });
    }
    Ok(resources)
}
