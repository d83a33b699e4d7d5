use std::time::Duration;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const DEFAULT_OPEN_RETRY_TIMES: u32 = 3;
pub(crate) const OPEN_RETRY_DELAY_MS: u64 = 300;

/// Chunk size used when draining a byte stream with no terminators configured
pub(crate) const STREAM_DRAIN_BLOCK: usize = 8;
pub(crate) const USB_MAX_READ_SIZE: usize = 65536;
pub(crate) const TCP_DRAIN_BLOCK: usize = 4096;

/// Shortest timeout an FTDI chip accepts; zero means "wait forever" there
pub(crate) const MIN_DEVICE_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) const VISA_DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) const FTDI_VENDOR_ID: u16 = 0x0403;

pub(crate) const DEFAULT_TERM_WRITE: &[u8] = b"\r\n";
pub(crate) const DEFAULT_TERM_READ: &[u8] = b"\n";
pub(crate) const NETWORK_TERM_READ: &[u8] = b"\r\n";
