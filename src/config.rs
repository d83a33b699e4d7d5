//! Optional TOML configuration shared by the command line and applications.
//!
//! ```toml
//! timeout = 2.5
//! datatype = "str"
//! term_write = "\r\n"
//!
//! [cooldown]
//! all = 0.01
//! write = 0.1
//!
//! [defaults.serial]
//! port = "COM3"
//! baudrate = 115200
//! ```

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::backend::{BackendOptions, DataType, seconds};
use crate::cooldown::CooldownTable;
use crate::error::{CommError, CommResult};
use crate::params::{Conn, ConnParams};
use crate::registry::BackendDefaults;
use crate::terminator::Terminators;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabConfig {
    /// Operation timeout in seconds
    pub timeout: Option<f64>,
    pub datatype: Option<String>,
    pub term_write: Option<String>,
    pub term_read: Option<Vec<String>>,
    /// Operation kind (or `all`) to cooldown in seconds
    pub cooldown: IndexMap<String, f64>,
    /// Default connection parameters per backend kind
    pub defaults: IndexMap<String, ConnParams>,
}

impl LabConfig {
    pub fn load(path: impl AsRef<Path>) -> CommResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        debug!("Loading configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CommResult<Self> {
        toml::from_str(content)
            .map_err(|e| CommError::Validation(format!("invalid configuration: {e}")))
    }

    /// Backend options described by the file; unset entries keep the
    /// backend defaults.
    pub fn backend_options(&self) -> CommResult<BackendOptions> {
        let mut opts = BackendOptions::new();
        if let Some(timeout) = self.timeout {
            opts = opts.timeout(seconds(timeout)?);
        }
        if let Some(datatype) = &self.datatype {
            opts = opts.datatype(datatype.parse::<DataType>()?);
        }
        if let Some(term) = &self.term_write {
            opts = opts.term_write(term);
        }
        if let Some(terms) = &self.term_read {
            opts = opts.term_read(Terminators::new(terms));
        }
        if !self.cooldown.is_empty() {
            let mut table = CooldownTable::new();
            table.setup_many(self.cooldown.iter().map(|(k, v)| (k.as_str(), *v)))?;
            opts = opts.cooldown(table);
        }
        Ok(opts)
    }

    pub fn defaults(&self) -> BackendDefaults {
        self.defaults
            .iter()
            .map(|(kind, params)| (kind.clone(), Conn::Named(params.clone())))
            .collect()
    }
}
