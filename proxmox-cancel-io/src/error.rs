//! Error type shared by all cancellation aware readers and writers.
//!
//! The type is `Clone` since the same error is often handed out more than once: a closed pipe
//! keeps returning the error it was closed with, and a canceled [`Signal`](proxmox_cancel::Signal)
//! keeps returning its reason.

use std::io;
use std::sync::Arc;

use proxmox_cancel::Reason;

/// Errors returned by [`CancelRead`](crate::CancelRead) and [`CancelWrite`](crate::CancelWrite)
/// implementations and the helpers built on top of them.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The signal passed to the call was canceled or its deadline passed.
    #[error(transparent)]
    Canceled(#[from] Reason),

    /// No more data will arrive.
    ///
    /// Readers signal end of data with `Ok(0)`, this variant is returned by helpers which need
    /// a minimum amount of data, and stored by pipe writers closed without an error.
    #[error("end of data")]
    Eof,

    /// End of data arrived in the middle of a fixed size read.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Read or write on a closed pipe.
    #[error("read/write on closed pipe")]
    ClosedPipe,

    /// The adapter was closed.
    #[error("use of closed reader or writer")]
    Closed,

    /// A writer reported more bytes written than it was given.
    #[error("invalid write result")]
    InvalidWrite,

    /// A writer accepted fewer bytes than it was given without failing.
    #[error("short write")]
    ShortWrite,

    /// The buffer passed in is too small for the requested operation.
    #[error("short buffer")]
    ShortBuffer,

    /// An error from the wrapped handle.
    #[error(transparent)]
    Io(Arc<io::Error>),

    /// Any other error, mostly used to close pipes with a custom error.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

/// Result type with [`Error`] as the default error.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A bulk operation stopped by `error` after `done` bytes were transferred.
///
/// Returned by [`copy`](crate::copy()) and [`read_at_least`](crate::read_at_least), whose
/// callers need to know how much of the data made it before the failure.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{error} (after {done} bytes)")]
pub struct PartialError {
    pub done: u64,
    #[source]
    pub error: Error,
}

impl PartialError {
    pub fn new(done: u64, error: Error) -> Self {
        Self { done, error }
    }

    /// Drop the byte count.
    pub fn into_error(self) -> Error {
        self.error
    }
}

impl From<PartialError> for Error {
    fn from(err: PartialError) -> Self {
        err.error
    }
}

impl From<PartialError> for io::Error {
    fn from(err: PartialError) -> Self {
        err.error.into()
    }
}

impl Error {
    /// Wrap an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Other(Arc::new(err))
    }

    /// Check whether this error is caused by a done [`Signal`](proxmox_cancel::Signal).
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled(_))
    }

    /// The cancellation reason, if this is a cancellation.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            Error::Canceled(reason) => Some(*reason),
            _ => None,
        }
    }

    /// The kind of the corresponding `std::io::Error`.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Error::Canceled(Reason::Canceled) => io::ErrorKind::Interrupted,
            Error::Canceled(Reason::DeadlineExceeded) => io::ErrorKind::TimedOut,
            Error::Eof | Error::UnexpectedEof => io::ErrorKind::UnexpectedEof,
            Error::ClosedPipe => io::ErrorKind::BrokenPipe,
            Error::Closed => io::ErrorKind::NotConnected,
            Error::InvalidWrite => io::ErrorKind::InvalidData,
            Error::ShortWrite => io::ErrorKind::WriteZero,
            Error::ShortBuffer => io::ErrorKind::InvalidInput,
            Error::Io(err) => err.kind(),
            Error::Other(_) => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => match Arc::try_unwrap(err) {
                Ok(err) => err,
                Err(err) => io::Error::new(err.kind(), Error::Io(err)),
            },
            other => io::Error::new(other.kind(), other),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use proxmox_cancel::Reason;

    use super::{Error, PartialError};

    #[test]
    fn test_io_conversion() {
        let err: io::Error = Error::Canceled(Reason::DeadlineExceeded).into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.to_string(), "deadline exceeded");

        // ENOENT
        let err: io::Error = Error::from(io::Error::from_raw_os_error(2)).into();
        assert_eq!(err.raw_os_error(), Some(2));

        let shared = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        let keep = shared.clone();
        let err: io::Error = shared.into();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(keep.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_partial() {
        let err = PartialError::new(10, Error::ClosedPipe);
        assert_eq!(err.to_string(), "read/write on closed pipe (after 10 bytes)");
        assert!(matches!(Error::from(err.clone()), Error::ClosedPipe));
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_reason() {
        let err = Error::from(Reason::Canceled);
        assert!(err.is_canceled());
        assert_eq!(err.reason(), Some(Reason::Canceled));
        assert!(!Error::ClosedPipe.is_canceled());
        assert_eq!(Error::ClosedPipe.reason(), None);
    }
}
