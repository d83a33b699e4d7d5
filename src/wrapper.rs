use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tracing::warn;

use crate::backend::Backend;
use crate::error::CommResult;

/// Base of instrument adapters: owns an opened backend and exposes its
/// lifecycle, locking and timeout. Reading and writing stay with the adapter.
#[derive(Debug)]
pub struct CommBackendWrapper {
    instr: Box<dyn Backend>,
}

impl CommBackendWrapper {
    pub fn new(instr: Box<dyn Backend>) -> Self {
        CommBackendWrapper { instr }
    }

    pub fn open(&mut self) -> CommResult<()> {
        self.instr.open()
    }

    pub fn close(&mut self) -> CommResult<()> {
        self.instr.close()
    }

    pub fn is_open(&self) -> bool {
        self.instr.is_open()
    }

    pub fn lock(&mut self, timeout: Option<Duration>) -> CommResult<()> {
        self.instr.lock(timeout)
    }

    pub fn unlock(&mut self) -> CommResult<()> {
        self.instr.unlock()
    }

    /// Hold the device lock until the guard is dropped
    pub fn locking(&mut self, timeout: Option<Duration>) -> CommResult<Locked<'_>> {
        self.lock(timeout)?;
        Ok(Locked { wrapper: self })
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> CommResult<()> {
        self.instr.set_timeout(timeout)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.instr.timeout()
    }

    /// Use `timeout` until the guard is dropped. `None` or the current
    /// timeout leave everything untouched.
    pub fn using_timeout(&mut self, timeout: Option<Duration>) -> CommResult<UsingTimeout<'_>> {
        let mut restore = None;
        if let Some(timeout) = timeout {
            let current = self.timeout();
            if current != Some(timeout) {
                self.set_timeout(Some(timeout))?;
                restore = Some(current);
            }
        }
        Ok(UsingTimeout {
            wrapper: self,
            restore,
        })
    }

    pub fn kind(&self) -> &str {
        self.instr.kind()
    }

    pub(crate) fn instr_mut(&mut self) -> &mut dyn Backend {
        self.instr.as_mut()
    }

    /// Give the backend back, e.g. to hand it to another adapter
    pub fn into_backend(self) -> Box<dyn Backend> {
        self.instr
    }
}

/// Scope returned by [`CommBackendWrapper::locking`]; unlocks on drop.
pub struct Locked<'a> {
    wrapper: &'a mut CommBackendWrapper,
}

impl Deref for Locked<'_> {
    type Target = CommBackendWrapper;

    fn deref(&self) -> &CommBackendWrapper {
        self.wrapper
    }
}

impl DerefMut for Locked<'_> {
    fn deref_mut(&mut self) -> &mut CommBackendWrapper {
        self.wrapper
    }
}

impl Drop for Locked<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.wrapper.unlock() {
            warn!("Failed to unlock {} backend: {}", self.wrapper.kind(), e);
        }
    }
}

/// Scope returned by [`CommBackendWrapper::using_timeout`]; restores the
/// previous timeout on drop.
pub struct UsingTimeout<'a> {
    wrapper: &'a mut CommBackendWrapper,
    restore: Option<Option<Duration>>,
}

impl Deref for UsingTimeout<'_> {
    type Target = CommBackendWrapper;

    fn deref(&self) -> &CommBackendWrapper {
        self.wrapper
    }
}

impl DerefMut for UsingTimeout<'_> {
    fn deref_mut(&mut self) -> &mut CommBackendWrapper {
        self.wrapper
    }
}

impl Drop for UsingTimeout<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            if let Err(e) = self.wrapper.set_timeout(previous) {
                warn!("Failed to restore {} backend timeout: {}", self.wrapper.kind(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOptions, SerialBackend, VisaBackend};
    use crate::interface::VisaCapabilities;
    use crate::interface::memory::MemoryDevice;

    fn wrapper(dev: &MemoryDevice) -> CommBackendWrapper {
        let backend = SerialBackend::with_interface(
            Box::new(dev.clone()),
            SerialBackend::default_conn(),
            &BackendOptions::new(),
        )
        .unwrap();
        CommBackendWrapper::new(Box::new(backend))
    }

    #[test]
    fn delegates_lifecycle() {
        let dev = MemoryDevice::new();
        let mut w = wrapper(&dev);
        assert!(w.is_open());
        w.close().unwrap();
        assert!(!w.is_open());
        w.open().unwrap();
        assert_eq!(dev.opens(), 2);
        assert_eq!(w.kind(), "serial");
        // Serial ports cannot lock; locking is a no-op
        let guard = w.locking(None).unwrap();
        drop(guard);
    }

    #[test]
    fn scoped_timeout_is_restored() {
        let dev = MemoryDevice::new();
        let mut w = wrapper(&dev);
        let before = w.timeout();
        {
            let mut scoped = w.using_timeout(Some(Duration::from_millis(30))).unwrap();
            assert_eq!(scoped.timeout(), Some(Duration::from_millis(30)));
            assert!(scoped.instr_mut().readline().is_err());
        }
        assert_eq!(w.timeout(), before);

        let sets = dev.timeout_sets();
        drop(w.using_timeout(before).unwrap());
        drop(w.using_timeout(None).unwrap());
        assert_eq!(dev.timeout_sets(), sets);
    }

    #[test]
    fn lock_scope_unlocks() {
        let dev = MemoryDevice::new();
        let backend = VisaBackend::with_session(
            Box::new(dev.clone()),
            VisaBackend::default_conn().with("addr", "GPIB0::5::INSTR"),
            &BackendOptions::new().do_lock(true),
        )
        .unwrap();
        let mut w = CommBackendWrapper::new(Box::new(backend));
        {
            let scoped = w.locking(None).unwrap();
            assert!(dev.is_locked());
            assert_eq!(scoped.kind(), "visa");
        }
        assert!(!dev.is_locked());

        let dev = MemoryDevice::new().with_visa_capabilities(VisaCapabilities {
            separate_termination: true,
            timeout_in_millis: true,
            locking: false,
        });
        let backend = VisaBackend::with_session(
            Box::new(dev),
            VisaBackend::default_conn(),
            &BackendOptions::new().do_lock(true),
        )
        .unwrap();
        let mut w = CommBackendWrapper::new(Box::new(backend));
        assert!(w.locking(None).is_err());
    }
}
