use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use tracing::{debug, trace};

use super::{DeviceInterface, Resource};
use crate::error::{CommError, CommResult};
use crate::params::ConnParams;

/// Line settings of a serial port, parsed from connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    /// Parse `port, baudrate, bytesize, parity, stopbits, xonxoff, rtscts, dsrdtr`.
    pub fn from_params(params: &ConnParams) -> CommResult<Self> {
        let port = params.require_str("port")?;
        let baud = params.int_or("baudrate", 19200)?;
        let baud = u32::try_from(baud)
            .map_err(|_| CommError::Validation(format!("invalid baud rate {baud}")))?;

        let data_bits = match params.int_or("bytesize", 8)? {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(CommError::Validation(format!("invalid byte size {other}")));
            }
        };

        let parity = match params.value("parity").and_then(|v| v.as_str()) {
            None | Some("N") | Some("n") => Parity::None,
            Some("E") | Some("e") => Parity::Even,
            Some("O") | Some("o") => Parity::Odd,
            Some(other) => {
                return Err(CommError::Validation(format!(
                    "unsupported parity '{other}'"
                )));
            }
        };

        let stop_bits = match params.value("stopbits").and_then(|v| v.as_f64()) {
            None => StopBits::One,
            Some(s) if s == 1.0 => StopBits::One,
            Some(s) if s == 2.0 => StopBits::Two,
            Some(other) => {
                return Err(CommError::Validation(format!(
                    "unsupported stop bits {other}"
                )));
            }
        };

        let hardware = params.bool_or("rtscts", false)? || params.bool_or("dsrdtr", false)?;
        let flow_control = if hardware {
            FlowControl::Hardware
        } else if params.bool_or("xonxoff", false)? {
            FlowControl::Software
        } else {
            FlowControl::None
        };

        Ok(SerialSettings {
            port,
            baud,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }
}

/// Serial port session over the `serialport` crate
pub struct SerialPortDevice {
    settings: SerialSettings,
    serial_port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
    dtr_on_open: bool,
}

impl SerialPortDevice {
    /// Create a closed session; nothing touches the port until [`DeviceInterface::open`].
    pub fn new(settings: SerialSettings, timeout: Duration) -> SerialPortDevice {
        SerialPortDevice {
            settings,
            serial_port: None,
            timeout,
            dtr_on_open: true,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    fn port_mut(&mut self) -> CommResult<&mut Box<dyn SerialPort>> {
        let name = &self.settings.port;
        self.serial_port
            .as_mut()
            .ok_or_else(|| CommError::Communication(format!("serial port {name} is not open")))
    }
}

impl std::fmt::Debug for SerialPortDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortDevice")
            .field("settings", &self.settings)
            .field("open", &self.serial_port.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DeviceInterface for SerialPortDevice {
    fn open(&mut self) -> CommResult<()> {
        if self.serial_port.is_some() {
            return Ok(());
        }
        let s = &self.settings;
        let serial_port = serialport::new(s.port.as_str(), s.baud)
            .data_bits(s.data_bits)
            .parity(s.parity)
            .stop_bits(s.stop_bits)
            .flow_control(s.flow_control)
            .timeout(self.timeout)
            .dtr_on_open(self.dtr_on_open)
            .open()?;
        debug!("Opened serial port {} at {} baud", s.port, s.baud);
        self.serial_port = Some(serial_port);
        Ok(())
    }

    fn close(&mut self) -> CommResult<()> {
        if self.serial_port.take().is_some() {
            debug!("Closed serial port {}", self.settings.port);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.serial_port.is_some()
    }

    fn read(&mut self, size: usize) -> CommResult<Vec<u8>> {
        let serial_port = self.port_mut()?;
        let mut buffer = vec![0; size];
        let mut filled = 0;

        // Block until `size` bytes arrived or the port times out
        while filled < size {
            match serial_port.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        buffer.truncate(filled);
        trace!("Received bytes {:?}", buffer);
        Ok(buffer)
    }

    fn write(&mut self, data: &[u8]) -> CommResult<()> {
        self.port_mut()?.write_all(data)?;
        trace!("Sent bytes {:?}", data);
        Ok(())
    }

    fn flush(&mut self) -> CommResult<()> {
        self.port_mut()?.flush()?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> CommResult<()> {
        self.timeout = timeout;
        if let Some(serial_port) = self.serial_port.as_mut() {
            serial_port.set_timeout(timeout)?;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn set_dtr(&mut self, level: bool) -> CommResult<()> {
        match self.serial_port.as_mut() {
            Some(serial_port) => serial_port.write_data_terminal_ready(level)?,
            None => self.dtr_on_open = level,
        }
        Ok(())
    }
}

/// List serial ports known to the system, optionally restricted to one USB vendor.
pub(crate) fn list_ports(desc: bool, vendor: Option<u16>) -> CommResult<Vec<Resource>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .filter(|p| match (vendor, &p.port_type) {
            (None, _) => true,
            (Some(vid), SerialPortType::UsbPort(info)) => info.vid == vid,
            (Some(_), _) => false,
        })
        .map(|p| {
            if !desc {
                return Resource::Address(p.port_name);
            }
            match p.port_type {
                SerialPortType::UsbPort(info) => Resource::SerialPort {
                    name: p.port_name,
                    vendor_id: Some(info.vid),
                    product_id: Some(info.pid),
                    serial_number: info.serial_number,
                    manufacturer: info.manufacturer,
                    product: info.product,
                },
                _ => Resource::SerialPort {
                    name: p.port_name,
                    vendor_id: None,
                    product_id: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;

    #[test]
    fn settings_from_defaults() {
        let params = ConnParams::new()
            .with("port", "COM1")
            .with("baudrate", 19200)
            .with("bytesize", 8)
            .with("parity", "N")
            .with("stopbits", 1)
            .with("xonxoff", 0)
            .with("rtscts", 0)
            .with("dsrdtr", 0);
        let s = SerialSettings::from_params(&params).unwrap();
        assert_eq!(s.port, "COM1");
        assert_eq!(s.baud, 19200);
        assert_eq!(s.data_bits, DataBits::Eight);
        assert_eq!(s.parity, Parity::None);
        assert_eq!(s.stop_bits, StopBits::One);
        assert_eq!(s.flow_control, FlowControl::None);
    }

    #[test]
    fn settings_flow_control_and_parity() {
        let params = ConnParams::new()
            .with("port", "/dev/ttyUSB0")
            .with("parity", "E")
            .with("stopbits", 2)
            .with("xonxoff", 1);
        let s = SerialSettings::from_params(&params).unwrap();
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.stop_bits, StopBits::Two);
        assert_eq!(s.flow_control, FlowControl::Software);

        let params = params.with("dsrdtr", true);
        let s = SerialSettings::from_params(&params).unwrap();
        assert_eq!(s.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn settings_reject_invalid_values() {
        let base = ConnParams::new().with("port", "COM1");
        assert!(SerialSettings::from_params(&base.clone().with("bytesize", 9)).is_err());
        assert!(SerialSettings::from_params(&base.clone().with("parity", "M")).is_err());
        assert!(SerialSettings::from_params(&base.clone().with("stopbits", 1.5)).is_err());
        assert!(SerialSettings::from_params(&base.with("baudrate", -5)).is_err());
        assert!(
            SerialSettings::from_params(&ConnParams::new().with("port", ParamValue::Null))
                .is_err()
        );
    }

    #[test]
    fn closed_port_keeps_settings() {
        let settings = SerialSettings::from_params(&ConnParams::new().with("port", "COM1")).unwrap();
        let mut dev = SerialPortDevice::new(settings, Duration::from_secs(1));
        assert!(!dev.is_open());
        dev.set_timeout(Duration::from_millis(5)).unwrap();
        assert_eq!(dev.timeout(), Some(Duration::from_millis(5)));
        dev.set_dtr(false).unwrap();
        assert!(dev.read(1).is_err());
        dev.close().unwrap();
    }
}
