//! Thorlabs serial instruments: FW102/212 filter wheels and MDT693A/4A
//! piezo drivers.
//!
//! These controllers echo every command and end replies with a `> ` prompt,
//! so each write drops stale input first and consumes the echo afterwards.

use std::time::Duration;

use tracing::debug;

use crate::backend::{Backend, BackendOptions, WriteOptions};
use crate::error::{CommError, CommResult};
use crate::registry::{BackendDefaults, Connection, Registry};
use crate::wrapper::CommBackendWrapper;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MDT_ID_TIMEOUT: Duration = Duration::from_secs(2);

fn write_command(instr: &mut dyn Backend, msg: &str) -> CommResult<()> {
    instr.flush_read()?;
    instr.write_with(msg.as_bytes(), &WriteOptions::with_echo(1))
}

fn read_reply(instr: &mut dyn Backend) -> CommResult<String> {
    loop {
        let line = instr.readline()?.to_text();
        let mut reply = line.trim();
        while let Some(rest) = reply.strip_prefix('>') {
            reply = rest.trim();
        }
        if !reply.is_empty() {
            return Ok(reply.to_owned());
        }
    }
}

/// Generic Thorlabs serial device
#[derive(Debug)]
pub struct ThorlabsInterface {
    wrapper: CommBackendWrapper,
}

impl ThorlabsInterface {
    pub fn backend_options() -> BackendOptions {
        BackendOptions::new()
            .term_read(vec!["\r", "\n"])
            .term_write("\r")
            .timeout(DEFAULT_TIMEOUT)
    }

    /// Serial port settings used when the connection leaves them out
    pub fn backend_defaults() -> BackendDefaults {
        let mut defaults = BackendDefaults::new();
        defaults.insert("serial".to_owned(), ("COM1", 115200).into());
        defaults
    }

    /// Connect through a serial port, e.g. `"COM3"` or `("COM3", 115200)`
    pub fn new(conn: impl Into<Connection>) -> CommResult<Self> {
        let backend = Registry::global().new_backend(
            conn,
            "serial",
            Some(&Self::backend_defaults()),
            &Self::backend_options(),
        )?;
        Self::from_backend(backend)
    }

    pub fn from_backend(instr: Box<dyn Backend>) -> CommResult<Self> {
        let mut wrapper = CommBackendWrapper::new(instr);
        wrapper.instr_mut().flush_read()?;
        Ok(ThorlabsInterface { wrapper })
    }

    pub fn open(&mut self) -> CommResult<()> {
        self.wrapper.open()?;
        self.wrapper.instr_mut().flush_read()?;
        Ok(())
    }

    pub fn close(&mut self) -> CommResult<()> {
        self.wrapper.close()
    }

    pub fn is_open(&self) -> bool {
        self.wrapper.is_open()
    }

    pub fn kind(&self) -> &str {
        self.wrapper.kind()
    }

    pub fn wrapper(&mut self) -> &mut CommBackendWrapper {
        &mut self.wrapper
    }

    pub fn write(&mut self, msg: &str) -> CommResult<()> {
        write_command(self.wrapper.instr_mut(), msg)
    }

    /// Next non-empty reply, without surrounding whitespace and prompts
    pub fn read(&mut self) -> CommResult<String> {
        read_reply(self.wrapper.instr_mut())
    }

    pub fn ask(&mut self, msg: &str) -> CommResult<String> {
        self.write(msg)?;
        self.read()
    }

    pub fn query_int(&mut self, msg: &str) -> CommResult<i64> {
        let reply = self.ask(msg)?;
        reply.parse().map_err(|_| {
            CommError::Communication(format!("unexpected reply to {msg}: '{reply}'"))
        })
    }

    pub fn query_float(&mut self, msg: &str) -> CommResult<f64> {
        let reply = self.ask(msg)?;
        reply.parse().map_err(|_| {
            CommError::Communication(format!("unexpected reply to {msg}: '{reply}'"))
        })
    }

    /// Ask for the identification string with `id_command`
    pub fn get_id(&mut self, id_command: &str, timeout: Option<Duration>) -> CommResult<String> {
        let mut scoped = self.wrapper.using_timeout(timeout)?;
        write_command(scoped.instr_mut(), id_command)?;
        read_reply(scoped.instr_mut())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// External trigger input
    In,
    /// Trigger output
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorMode {
    /// Sensors off when idle, which removes stray light
    Off,
    On,
}

fn flag(name: &str, code: i64) -> CommResult<bool> {
    match code {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CommError::Communication(format!(
            "unexpected {name} value {other}"
        ))),
    }
}

/// Thorlabs FW102/212 motorized filter wheel
#[derive(Debug)]
pub struct FilterWheel {
    intf: ThorlabsInterface,
    pcount: i64,
    respect_bound: bool,
}

impl FilterWheel {
    /// With `respect_bound`, moves that could cross between the last and the
    /// first position go around the wheel instead.
    pub fn new(conn: impl Into<Connection>, respect_bound: bool) -> CommResult<Self> {
        Self::from_interface(ThorlabsInterface::new(conn)?, respect_bound)
    }

    pub fn from_interface(mut intf: ThorlabsInterface, respect_bound: bool) -> CommResult<Self> {
        let pcount = intf.query_int("pcount?")?;
        Ok(FilterWheel {
            intf,
            pcount,
            respect_bound,
        })
    }

    pub fn interface(&mut self) -> &mut ThorlabsInterface {
        &mut self.intf
    }

    pub fn get_id(&mut self) -> CommResult<String> {
        self.intf.get_id("*idn?", None)
    }

    /// Current position, starting from 1
    pub fn position(&mut self) -> CommResult<i64> {
        self.intf.query_int("pos?")
    }

    pub fn set_position(&mut self, pos: i64) -> CommResult<i64> {
        if self.respect_bound {
            let cur = self.position()?;
            if (pos - cur).abs() >= self.pcount / 2 {
                let medp1 = (2 * cur + pos).div_euclid(3);
                let medp2 = (cur + 2 * pos).div_euclid(3);
                debug!("Moving filter wheel {} -> {} via {}, {}", cur, pos, medp1, medp2);
                self.intf.write(&format!("pos={medp1}"))?;
                self.intf.write(&format!("pos={medp2}"))?;
            }
        }
        self.intf.write(&format!("pos={pos}"))?;
        self.position()
    }

    /// Number of wheel positions (6 or 12)
    pub fn pcount(&mut self) -> CommResult<i64> {
        self.intf.query_int("pcount?")
    }

    pub fn set_pcount(&mut self, pcount: i64) -> CommResult<i64> {
        self.intf.write(&format!("pcount={pcount}"))?;
        self.pcount = self.pcount()?;
        Ok(self.pcount)
    }

    pub fn speed_mode(&mut self) -> CommResult<SpeedMode> {
        let high = flag("speed", self.intf.query_int("speed?")?)?;
        Ok(if high { SpeedMode::High } else { SpeedMode::Low })
    }

    pub fn set_speed_mode(&mut self, mode: SpeedMode) -> CommResult<SpeedMode> {
        self.intf
            .write(&format!("speed={}", u8::from(mode == SpeedMode::High)))?;
        self.speed_mode()
    }

    pub fn trigger_mode(&mut self) -> CommResult<TriggerMode> {
        let out = flag("trig", self.intf.query_int("trig?")?)?;
        Ok(if out { TriggerMode::Out } else { TriggerMode::In })
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> CommResult<TriggerMode> {
        self.intf
            .write(&format!("trig={}", u8::from(mode == TriggerMode::Out)))?;
        self.trigger_mode()
    }

    pub fn sensor_mode(&mut self) -> CommResult<SensorMode> {
        let on = flag("sensors", self.intf.query_int("sensors?")?)?;
        Ok(if on { SensorMode::On } else { SensorMode::Off })
    }

    pub fn set_sensor_mode(&mut self, mode: SensorMode) -> CommResult<SensorMode> {
        self.intf
            .write(&format!("sensors={}", u8::from(mode == SensorMode::On)))?;
        self.sensor_mode()
    }

    /// Store the current settings as power-on defaults
    pub fn store_settings(&mut self) -> CommResult<()> {
        self.intf.write("save")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    X,
    Y,
    Z,
}

impl Channel {
    fn letter(&self) -> char {
        match self {
            Channel::X => 'X',
            Channel::Y => 'Y',
            Channel::Z => 'Z',
        }
    }
}

/// Value of a `[ 12.34]` style reply
fn parse_bracketed(reply: &str) -> CommResult<f64> {
    let reply = reply.trim();
    reply
        .get(2..reply.len().saturating_sub(1))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| CommError::Communication(format!("unexpected reply '{reply}'")))
}

/// Thorlabs MDT693A/4A piezo high-voltage source
#[derive(Debug)]
pub struct Mdt69xA {
    intf: ThorlabsInterface,
}

impl Mdt69xA {
    pub fn new(conn: impl Into<Connection>) -> CommResult<Self> {
        Self::from_interface(ThorlabsInterface::new(conn)?)
    }

    /// Fails with an open error, leaving the port closed, when the device
    /// does not answer the identification query.
    pub fn from_interface(mut intf: ThorlabsInterface) -> CommResult<Self> {
        match intf.get_id("I", Some(MDT_ID_TIMEOUT)) {
            Ok(id) => {
                debug!("Connected to {}", id);
                Ok(Mdt69xA { intf })
            }
            Err(e) => {
                let kind = intf.kind().to_owned();
                if let Err(close_err) = intf.close() {
                    debug!("Failed to close {} backend after id check: {}", kind, close_err);
                }
                Err(CommError::open(kind, e))
            }
        }
    }

    pub fn interface(&mut self) -> &mut ThorlabsInterface {
        &mut self.intf
    }

    pub fn get_id(&mut self) -> CommResult<String> {
        self.intf.get_id("I", None)
    }

    /// Output voltage of `channel`, in volts
    pub fn voltage(&mut self, channel: Channel) -> CommResult<f64> {
        let reply = self.intf.ask(&format!("{}R?", channel.letter()))?;
        parse_bracketed(&reply)
    }

    pub fn set_voltage(&mut self, voltage: f64, channel: Channel) -> CommResult<f64> {
        self.intf
            .write(&format!("{}V{:.3}", channel.letter(), voltage))?;
        self.voltage(channel)
    }

    /// Selected output range in volts (75, 100 or 150)
    pub fn voltage_range(&mut self) -> CommResult<f64> {
        let reply = self.intf.ask("%")?;
        parse_bracketed(&reply)
    }
}
