use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommError {
    /// Construction or opening of a backend failed. Always carries the transport cause.
    #[error("Could not open {backend} backend: {source}")]
    Open {
        backend: String,
        #[source]
        source: Box<CommError>,
    },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[cfg(feature = "usb")]
    #[error(transparent)]
    Usb(#[from] rusb::Error),

    #[cfg(feature = "visa")]
    #[error(transparent)]
    Visa(#[from] visa_rs::Error),
}

impl CommError {
    /// Wrap a transport failure raised while opening `backend`.
    ///
    /// An error that is already an open error is passed through unchanged.
    pub fn open(backend: impl Into<String>, cause: CommError) -> CommError {
        match cause {
            CommError::Open { .. } => cause,
            cause => CommError::Open {
                backend: backend.into(),
                source: Box::new(cause),
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            CommError::Timeout(_) => true,
            CommError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// True for every failure that can happen during an already open session,
    /// whatever the transport is.
    pub fn is_communication(&self) -> bool {
        match self {
            CommError::Communication(_)
            | CommError::Timeout(_)
            | CommError::Io(_)
            | CommError::Serial(_) => true,
            #[cfg(feature = "usb")]
            CommError::Usb(_) => true,
            #[cfg(feature = "visa")]
            CommError::Visa(_) => true,
            _ => false,
        }
    }

    pub fn is_open_error(&self) -> bool {
        matches!(self, CommError::Open { .. })
    }
}

pub type CommResult<T> = std::result::Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_wraps_cause_once() {
        let err = CommError::open("serial", CommError::Communication("busy".into()));
        assert!(err.is_open_error());
        assert!(err.to_string().contains("serial"));
        assert!(err.to_string().contains("busy"));

        let again = CommError::open("network", err);
        match again {
            CommError::Open { backend, .. } => assert_eq!(backend, "serial"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn timeout_is_a_communication_error() {
        let err = CommError::Timeout("no terminator".into());
        assert!(err.is_timeout());
        assert!(err.is_communication());
        assert!(!CommError::Validation("bad".into()).is_communication());

        let io = CommError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t"));
        assert!(io.is_timeout());
    }
}
