//! Backend registry, connection autodetection and the backend factory.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::backend::{
    Backend, BackendOptions, Ft232Backend, NetworkBackend, SerialBackend, UsbBackend,
    VisaBackend,
};
use crate::error::{CommError, CommResult};
use crate::interface::Resource;
use crate::params::{Conn, ConnParams, ParamValue, normalize};

/// Backend kinds shipped with the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Visa,
    Serial,
    Ft232,
    Network,
    PyUsb,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Visa,
        BackendKind::Serial,
        BackendKind::Ft232,
        BackendKind::Network,
        BackendKind::PyUsb,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Visa => VisaBackend::KIND,
            BackendKind::Serial => SerialBackend::KIND,
            BackendKind::Ft232 => Ft232Backend::KIND,
            BackendKind::Network => NetworkBackend::KIND,
            BackendKind::PyUsb => UsbBackend::KIND,
        }
    }

    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Visa => VisaBackend::FIELDS,
            BackendKind::Serial => SerialBackend::FIELDS,
            BackendKind::Ft232 => Ft232Backend::FIELDS,
            BackendKind::Network => NetworkBackend::FIELDS,
            BackendKind::PyUsb => UsbBackend::FIELDS,
        }
    }

    pub fn default_conn(&self) -> ConnParams {
        match self {
            BackendKind::Visa => VisaBackend::default_conn(),
            BackendKind::Serial => SerialBackend::default_conn(),
            BackendKind::Ft232 => Ft232Backend::default_conn(),
            BackendKind::Network => NetworkBackend::default_conn(),
            BackendKind::PyUsb => UsbBackend::default_conn(),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| CommError::Validation(format!("unknown backend kind '{s}'")))
    }
}

pub type BuildFn = fn(ConnParams, &BackendOptions) -> CommResult<Box<dyn Backend>>;
pub type ListFn = fn(bool) -> CommResult<Vec<Resource>>;

/// How to build and list backends of one kind.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Positional field order of the connection parameters
    pub fields: &'static [&'static str],
    /// Parameters filled in when the caller leaves them out
    pub defaults: ConnParams,
    pub build: BuildFn,
    /// `None` when the kind cannot enumerate its resources
    pub list: Option<ListFn>,
}

impl RegistryEntry {
    fn builtin(kind: BackendKind, build: BuildFn, list: Option<ListFn>) -> Self {
        RegistryEntry {
            fields: kind.fields(),
            defaults: kind.default_conn(),
            build,
            list,
        }
    }
}

/// Caller-level default connection parameters, per backend kind.
pub type BackendDefaults = HashMap<String, Conn>;

/// Connection argument of the factory.
#[derive(Debug)]
pub enum Connection {
    /// An existing backend, returned as is
    Open(Box<dyn Backend>),
    /// Parameters for an explicitly named kind, overriding the kind argument
    Tagged(String, Conn),
    /// Parameters for the given or detected kind
    Params(Conn),
}

impl Connection {
    pub fn tagged(kind: impl Into<String>, conn: impl Into<Conn>) -> Self {
        Connection::Tagged(kind.into(), conn.into())
    }
}

impl From<Box<dyn Backend>> for Connection {
    fn from(backend: Box<dyn Backend>) -> Self {
        Connection::Open(backend)
    }
}

impl From<Conn> for Connection {
    fn from(conn: Conn) -> Self {
        Connection::Params(conn)
    }
}

impl From<ConnParams> for Connection {
    fn from(params: ConnParams) -> Self {
        Connection::Params(params.into())
    }
}

impl From<ParamValue> for Connection {
    fn from(value: ParamValue) -> Self {
        Connection::Params(value.into())
    }
}

impl From<Vec<ParamValue>> for Connection {
    fn from(values: Vec<ParamValue>) -> Self {
        Connection::Params(values.into())
    }
}

impl From<&str> for Connection {
    fn from(addr: &str) -> Self {
        Connection::Params(addr.into())
    }
}

impl From<String> for Connection {
    fn from(addr: String) -> Self {
        Connection::Params(addr.into())
    }
}

impl<A: Into<ParamValue>, B: Into<ParamValue>> From<(A, B)> for Connection {
    fn from(pair: (A, B)) -> Self {
        Connection::Params(pair.into())
    }
}

impl<A: Into<ParamValue>, B: Into<ParamValue>, C: Into<ParamValue>> From<(A, B, C)>
    for Connection
{
    fn from(triple: (A, B, C)) -> Self {
        Connection::Params(triple.into())
    }
}

static SERIAL_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^com\d+").expect("Invalid serial port regex"));
static NETWORK_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+\.){3}\d+(:\d+)?").expect("Invalid network address regex"));

fn is_serial_addr(value: Option<&ParamValue>) -> bool {
    value
        .and_then(ParamValue::as_str)
        .is_some_and(|s| SERIAL_ADDR.is_match(s))
}

fn is_network_addr(value: Option<&ParamValue>) -> bool {
    value
        .and_then(ParamValue::as_str)
        .is_some_and(|s| NETWORK_ADDR.is_match(s))
}

fn is_usb_id(value: &ParamValue) -> bool {
    matches!(value, ParamValue::Int(id) if (0..65536).contains(id))
}

/// Guess the backend kind from the shape of the connection parameters.
///
/// A pair of 16-bit integers is a USB vendor/product ID; strings looking
/// like an IPv4 address (with an optional port) are network addresses and
/// `COM<n>` strings are serial ports. Anything else gets `default`.
pub fn autodetect_backend(conn: &Conn, default: &str) -> String {
    let detected = match conn {
        Conn::Positional(values) => match values.as_slice() {
            [vid, pid, ..] if is_usb_id(vid) && is_usb_id(pid) => Some(UsbBackend::KIND),
            _ => classify_addr(values.first()),
        },
        Conn::Named(params) => {
            if is_network_addr(params.get("addr")) {
                Some(NetworkBackend::KIND)
            } else if is_serial_addr(params.get("port")) {
                Some(SerialBackend::KIND)
            } else if params.contains("vendorID") && params.contains("productID") {
                Some(UsbBackend::KIND)
            } else {
                None
            }
        }
        Conn::Scalar(value) => classify_addr(Some(value)),
    };
    detected.unwrap_or(default).to_owned()
}

fn classify_addr(value: Option<&ParamValue>) -> Option<&'static str> {
    if is_network_addr(value) {
        Some(NetworkBackend::KIND)
    } else if is_serial_addr(value) {
        Some(SerialBackend::KIND)
    } else {
        None
    }
}

fn build_serial(params: ConnParams, opts: &BackendOptions) -> CommResult<Box<dyn Backend>> {
    Ok(Box::new(SerialBackend::new(params, opts)?))
}

fn build_ft232(params: ConnParams, opts: &BackendOptions) -> CommResult<Box<dyn Backend>> {
    Ok(Box::new(Ft232Backend::new(params, opts)?))
}

fn build_network(params: ConnParams, opts: &BackendOptions) -> CommResult<Box<dyn Backend>> {
    Ok(Box::new(NetworkBackend::new(params, opts)?))
}

#[cfg(feature = "visa")]
fn build_visa(params: ConnParams, opts: &BackendOptions) -> CommResult<Box<dyn Backend>> {
    Ok(Box::new(VisaBackend::new(params, opts)?))
}

#[cfg(feature = "usb")]
fn build_usb(params: ConnParams, opts: &BackendOptions) -> CommResult<Box<dyn Backend>> {
    Ok(Box::new(UsbBackend::new(params, opts)?))
}

/// Mapping from backend kind name to its factory.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: IndexMap<String, RegistryEntry>,
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::probe);

impl Registry {
    /// A registry without any kinds
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register every built-in kind whose transport is usable on this machine.
    ///
    /// Kinds behind a missing library are left out rather than failing.
    pub fn probe() -> Self {
        let mut registry = Registry::empty();

        #[cfg(feature = "visa")]
        {
            if crate::interface::visa::probe() {
                registry.register(
                    BackendKind::Visa.name(),
                    RegistryEntry::builtin(
                        BackendKind::Visa,
                        build_visa,
                        Some(VisaBackend::list_resources),
                    ),
                );
            } else {
                info!("VISA library not found, visa backend disabled");
            }
        }

        registry.register(
            BackendKind::Serial.name(),
            RegistryEntry::builtin(
                BackendKind::Serial,
                build_serial,
                Some(SerialBackend::list_resources),
            ),
        );
        registry.register(
            BackendKind::Ft232.name(),
            RegistryEntry::builtin(
                BackendKind::Ft232,
                build_ft232,
                Some(Ft232Backend::list_resources),
            ),
        );
        registry.register(
            BackendKind::Network.name(),
            RegistryEntry::builtin(BackendKind::Network, build_network, None),
        );

        #[cfg(feature = "usb")]
        {
            if crate::interface::usb::probe() {
                registry.register(
                    BackendKind::PyUsb.name(),
                    RegistryEntry::builtin(
                        BackendKind::PyUsb,
                        build_usb,
                        Some(UsbBackend::list_resources),
                    ),
                );
            } else {
                info!("libusb not available, pyusb backend disabled");
            }
        }

        info!("Available backends: {}", registry.available().join(", "));
        registry
    }

    /// The process-wide registry, probed on first use
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Add or replace a backend kind
    pub fn register(&mut self, name: impl Into<String>, entry: RegistryEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn available(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn entry(&self, kind: &str) -> CommResult<&RegistryEntry> {
        self.entries.get(kind).ok_or_else(|| {
            CommError::Validation(format!(
                "unknown backend '{kind}', available: {}",
                self.available().join(", ")
            ))
        })
    }

    /// Build and open a backend.
    ///
    /// `kind` may be `"auto"` to detect it from `conn`. Parameters are merged
    /// in priority order: `conn`, then `defaults[kind]`, then the kind's own
    /// defaults. An already open backend is returned unchanged.
    pub fn new_backend(
        &self,
        conn: impl Into<Connection>,
        kind: &str,
        defaults: Option<&BackendDefaults>,
        options: &BackendOptions,
    ) -> CommResult<Box<dyn Backend>> {
        let conn = match conn.into() {
            Connection::Open(backend) => return Ok(backend),
            Connection::Tagged(kind, conn) => {
                return self.new_backend(Connection::Params(conn), &kind, defaults, options);
            }
            Connection::Params(conn) => conn,
        };
        if let Conn::Positional(values) = &conn {
            if let [ParamValue::Str(tag), inner] = values.as_slice() {
                if self.contains(tag) {
                    let inner = Conn::Scalar(inner.clone());
                    return self.new_backend(Connection::Params(inner), tag, defaults, options);
                }
            }
        }

        let kind = if kind == "auto" {
            autodetect_backend(&conn, VisaBackend::KIND)
        } else {
            kind.to_owned()
        };
        let entry = self.entry(&kind)?;
        let mut params = normalize(&conn, entry.fields)?;
        if let Some(extra) = defaults.and_then(|d| d.get(&kind)) {
            params = params.overlay(&normalize(extra, entry.fields)?);
        }
        let params = params.overlay(&entry.defaults);
        debug!("Building {} backend with {}", kind, params);
        (entry.build)(params, options)
    }

    /// Resources of one kind; `None` when the kind cannot list them
    pub fn list(&self, kind: &str, desc: bool) -> CommResult<Option<Vec<Resource>>> {
        match self.entry(kind)?.list {
            Some(list) => list(desc).map(Some),
            None => Ok(None),
        }
    }

    /// Resources of `kind`, or of every kind able to list them.
    pub fn list_backend_resources(
        &self,
        kind: Option<&str>,
        desc: bool,
    ) -> CommResult<IndexMap<String, Vec<Resource>>> {
        let mut resources = IndexMap::new();
        match kind {
            Some(kind) => {
                let found = self.list(kind, desc)?.ok_or_else(|| {
                    CommError::Unsupported(format!("{kind} backend cannot list resources"))
                })?;
                resources.insert(kind.to_owned(), found);
            }
            None => {
                for name in self.entries.keys() {
                    if let Some(found) = self.list(name, desc)? {
                        resources.insert(name.clone(), found);
                    }
                }
            }
        }
        Ok(resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::memory::MemoryDevice;

    fn build_memory(params: ConnParams, opts: &BackendOptions) -> CommResult<Box<dyn Backend>> {
        Ok(Box::new(SerialBackend::with_interface(
            Box::new(MemoryDevice::new()),
            params,
            opts,
        )?))
    }

    fn list_memory(desc: bool) -> CommResult<Vec<Resource>> {
        let _ = desc;
        Ok(vec![Resource::Address("mem0".into())])
    }

    fn memory_registry() -> Registry {
        let mut registry = Registry::empty();
        registry.register(
            "memory",
            RegistryEntry {
                fields: SerialBackend::FIELDS,
                defaults: SerialBackend::default_conn(),
                build: build_memory,
                list: Some(list_memory),
            },
        );
        registry.register(
            "silent",
            RegistryEntry {
                fields: NetworkBackend::FIELDS,
                defaults: NetworkBackend::default_conn(),
                build: build_memory,
                list: None,
            },
        );
        registry
    }

    #[test]
    fn detects_kinds() {
        assert_eq!(autodetect_backend(&"192.168.0.5:80".into(), "visa"), "network");
        assert_eq!(autodetect_backend(&"COM7".into(), "visa"), "serial");
        assert_eq!(autodetect_backend(&"com12".into(), "visa"), "serial");
        assert_eq!(autodetect_backend(&(0x0403, 0x6001).into(), "visa"), "pyusb");
        assert_eq!(
            autodetect_backend(&"USB0::0x1313::0x8078::INSTR".into(), "visa"),
            "visa"
        );
        assert_eq!(autodetect_backend(&("COM3", 9600).into(), "visa"), "serial");
        assert_eq!(autodetect_backend(&(70000, 1).into(), "visa"), "visa");
    }

    #[test]
    fn detects_named_parameters() {
        let net = ConnParams::new().with("addr", "10.0.0.2");
        assert_eq!(autodetect_backend(&net.into(), "visa"), "network");
        let serial = ConnParams::new().with("port", "COM1").with("baudrate", 9600);
        assert_eq!(autodetect_backend(&serial.into(), "visa"), "serial");
        let usb = ConnParams::new().with("vendorID", 1).with("productID", 2);
        assert_eq!(autodetect_backend(&usb.into(), "visa"), "pyusb");
        let other = ConnParams::new().with("port", "/dev/ttyUSB0");
        assert_eq!(autodetect_backend(&other.into(), "serial"), "serial");
    }

    #[test]
    fn kind_names() {
        let names: Vec<_> = BackendKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, ["visa", "serial", "ft232", "network", "pyusb"]);
        assert_eq!("ft232".parse::<BackendKind>().unwrap(), BackendKind::Ft232);
        assert!("gpib".parse::<BackendKind>().is_err());
    }

    #[test]
    fn factory_merges_defaults() {
        let registry = memory_registry();
        let mut defaults = BackendDefaults::new();
        defaults.insert("memory".into(), ("COM9", 115200).into());

        let backend = registry
            .new_backend("COM4", "memory", Some(&defaults), &BackendOptions::new())
            .unwrap();
        let params = backend.params();
        assert_eq!(params.get("port").and_then(|v| v.as_str()), Some("COM4"));
        assert_eq!(params.get("baudrate").and_then(|v| v.as_i64()), Some(115200));
        assert_eq!(params.get("bytesize").and_then(|v| v.as_i64()), Some(8));
    }

    #[test]
    fn factory_passes_open_backend_through() {
        let registry = memory_registry();
        let dev = MemoryDevice::new();
        let backend: Box<dyn Backend> = Box::new(
            SerialBackend::with_interface(
                Box::new(dev.clone()),
                SerialBackend::default_conn(),
                &BackendOptions::new(),
            )
            .unwrap(),
        );
        let before = &*backend as *const dyn Backend as *const ();
        let same = registry
            .new_backend(backend, "auto", None, &BackendOptions::new())
            .unwrap();
        assert_eq!(&*same as *const dyn Backend as *const (), before);
        assert_eq!(dev.opens(), 1);
    }

    #[test]
    fn tagged_connection_overrides_kind() {
        let registry = memory_registry();
        let backend = registry
            .new_backend(
                Connection::tagged("memory", "COM2"),
                "network",
                None,
                &BackendOptions::new(),
            )
            .unwrap();
        assert_eq!(backend.params().get("port").and_then(|v| v.as_str()), Some("COM2"));

        let backend = registry
            .new_backend(("memory", "COM5"), "auto", None, &BackendOptions::new())
            .unwrap();
        assert_eq!(backend.params().get("port").and_then(|v| v.as_str()), Some("COM5"));
    }

    #[test]
    fn unknown_kind_is_a_validation_error() {
        let registry = memory_registry();
        let err = registry
            .new_backend("COM1", "gpib", None, &BackendOptions::new())
            .unwrap_err();
        assert!(matches!(err, CommError::Validation(_)));
        // "auto" falls back to visa, which is not registered here
        assert!(
            registry
                .new_backend("GPIB0::1::INSTR", "auto", None, &BackendOptions::new())
                .is_err()
        );
    }

    #[test]
    fn listing() {
        let registry = memory_registry();
        let all = registry.list_backend_resources(None, false).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["memory"], vec![Resource::Address("mem0".into())]);
        assert_eq!(registry.list("silent", true).unwrap(), None);
        assert!(matches!(
            registry.list_backend_resources(Some("silent"), true),
            Err(CommError::Unsupported(_))
        ));
    }

    #[test]
    fn probe_always_has_core_kinds() {
        let registry = Registry::global();
        for kind in ["serial", "ft232", "network"] {
            assert!(registry.contains(kind), "{kind} missing");
        }
        assert_eq!(registry.list("network", false).unwrap(), None);
    }
}
