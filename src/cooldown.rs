use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::trace;

use crate::error::{CommError, CommResult};

/// Kind of physical operation a cooldown applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Close,
    Read,
    Write,
    Timeout,
    Flush,
    Default,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Close => "close",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Timeout => "timeout",
            Operation::Flush => "flush",
            Operation::Default => "default",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Operation::Open),
            "close" => Ok(Operation::Close),
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            "timeout" => Ok(Operation::Timeout),
            "flush" => Ok(Operation::Flush),
            "default" => Ok(Operation::Default),
            other => Err(CommError::Validation(format!(
                "unknown cooldown kind '{other}'"
            ))),
        }
    }
}

/// Post-operation delays, per operation kind.
///
/// Some instrument firmware loses track of its state when commands follow
/// each other too quickly; backends wait the configured delay after every
/// physical operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownTable {
    delays: HashMap<Operation, Duration>,
}

impl Default for CooldownTable {
    fn default() -> Self {
        CooldownTable {
            delays: HashMap::from([(Operation::Default, Duration::ZERO)]),
        }
    }
}

impl CooldownTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, op: Operation, delay: Duration) {
        self.delays.insert(op, delay);
    }

    /// Reset the table to a single default entry.
    pub fn set_all(&mut self, delay: Duration) {
        self.delays = HashMap::from([(Operation::Default, delay)]);
    }

    /// Set a cooldown by its tag, in seconds. `"all"` resets the whole table.
    pub fn setup(&mut self, kind: &str, seconds: f64) -> CommResult<()> {
        let delay = Duration::try_from_secs_f64(seconds).map_err(|_| {
            CommError::Validation(format!(
                "cooldown for '{kind}' must be a non-negative number of seconds, got {seconds}"
            ))
        })?;
        if kind == "all" {
            self.set_all(delay);
        } else {
            self.set(kind.parse()?, delay);
        }
        Ok(())
    }

    /// Apply several `kind = seconds` pairs; `"all"` is handled first so the
    /// other entries of the same call survive the reset.
    pub fn setup_many<'a, I>(&mut self, entries: I) -> CommResult<()>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|(kind, _)| *kind != "all");
        for (kind, seconds) in entries {
            self.setup(kind, seconds)?;
        }
        Ok(())
    }

    pub fn get(&self, op: Operation) -> Duration {
        self.delays
            .get(&op)
            .or_else(|| self.delays.get(&Operation::Default))
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Sleep for the cooldown of `op`, if any.
    pub fn wait(&self, op: Operation) {
        let delay = self.get(op);
        if !delay.is_zero() {
            trace!("Cooldown {:?} after {}", delay, op);
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn defaults_to_zero() {
        let table = CooldownTable::new();
        assert_eq!(table.get(Operation::Read), Duration::ZERO);
        let start = Instant::now();
        table.wait(Operation::Write);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn specific_kind_overrides_default() {
        let mut table = CooldownTable::new();
        table.setup("default", 0.5).unwrap();
        table.setup("read", 0.01).unwrap();
        assert_eq!(table.get(Operation::Read), Duration::from_millis(10));
        assert_eq!(table.get(Operation::Write), Duration::from_millis(500));
    }

    #[test]
    fn all_resets_table() {
        let mut table = CooldownTable::new();
        table.setup_many([("read", 1.0), ("write", 2.0)]).unwrap();
        table.setup_many([("open", 0.25), ("all", 0.1)]).unwrap();
        assert_eq!(table.get(Operation::Read), Duration::from_millis(100));
        assert_eq!(table.get(Operation::Write), Duration::from_millis(100));
        assert_eq!(table.get(Operation::Open), Duration::from_millis(250));
    }

    #[test]
    fn rejects_bad_entries() {
        let mut table = CooldownTable::new();
        assert!(table.setup("read", -1.0).is_err());
        assert!(matches!(table.setup("read", 1e30), Err(CommError::Validation(_))));
        assert!(table.setup("all", f64::NAN).is_err());
        assert_eq!(table.get(Operation::Read), Duration::ZERO);
        assert!(table.setup("reed", 1.0).is_err());
        assert_eq!("flush".parse::<Operation>().unwrap(), Operation::Flush);
    }

    #[test]
    fn wait_sleeps_for_configured_delay() {
        let mut table = CooldownTable::new();
        table.set(Operation::Read, Duration::from_millis(30));
        let start = Instant::now();
        table.wait(Operation::Read);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
