//! Line-oriented communication with laboratory instruments.
//!
//! Serial ports, FTDI adapters, raw TCP sockets, VISA sessions and USB bulk
//! endpoints all sit behind the same [`Backend`] contract: open/close,
//! terminator-aware `readline`, fixed-size reads, writes with write
//! terminators and a scoped timeout. [`new_backend`] builds one from loosely
//! shaped connection parameters, detecting the kind when asked to.
//!
//! ```no_run
//! use labio::{BackendOptions, new_backend};
//!
//! let mut dev = new_backend("COM3", "auto", None, &BackendOptions::new())?;
//! let reply = dev.ask(b"*IDN?", None, false)?;
//! println!("{}", reply);
//! # Ok::<(), labio::error::CommError>(())
//! ```

use indexmap::IndexMap;

pub mod backend;
pub mod config;
pub(crate) mod constants;
pub mod cooldown;
pub mod devices;
pub mod error;
pub mod interface;
pub mod params;
pub mod registry;
pub mod terminator;
pub(crate) mod util;
pub mod wrapper;

pub use backend::{Backend, BackendOptions, Data, DataType, ReadlineOptions, WriteOptions};
pub use config::LabConfig;
pub use error::{CommError, CommResult};
pub use interface::Resource;
pub use params::{Conn, ConnParams, ParamValue};
pub use registry::{BackendDefaults, BackendKind, Connection, Registry, autodetect_backend};
pub use wrapper::CommBackendWrapper;

/// Build and open a backend through the process-wide registry.
///
/// See [`Registry::new_backend`].
pub fn new_backend(
    conn: impl Into<Connection>,
    kind: &str,
    defaults: Option<&BackendDefaults>,
    options: &BackendOptions,
) -> CommResult<Box<dyn Backend>> {
    Registry::global().new_backend(conn, kind, defaults, options)
}

/// List connectable resources of `kind`, or of every kind that can list them
pub fn list_backend_resources(
    kind: Option<&str>,
    desc: bool,
) -> CommResult<IndexMap<String, Vec<Resource>>> {
    Registry::global().list_backend_resources(kind, desc)
}
