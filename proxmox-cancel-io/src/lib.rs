//! Cancellation aware I/O on top of blocking handles.
//!
//! The [`CancelRead`] and [`CancelWrite`] traits take a [`Signal`] with every call. A call
//! returns once the operation completes or once the signal is done, whichever happens first.
//!
//! Blocking handles are turned into such readers and writers with one of two strategies:
//!
//! * Handles which support changing their I/O deadline while an operation is in flight
//!   ([`SetReadDeadline`], [`SetWriteDeadline`]) are driven directly by the caller, a watcher
//!   thread forces the deadline into the past when the signal fires ([`DeadlineReader`],
//!   [`DeadlineWriter`]).
//! * Any other handle is moved to a worker thread which performs all blocking calls
//!   ([`ProxyReader`], [`ProxyWriter`]). A canceled call returns promptly, but the native call
//!   keeps running in the background and its result is picked up by the next call.
//!
//! The [`pipe()`] function creates an in-memory synchronous pipe implementing the same contract
//! natively.
//!
//! Byte counts and errors: a read returning `Ok(0)` for a non-empty buffer means end of data.
//! A call which transferred some bytes before it was interrupted returns `Ok(n)`; the condition
//! which interrupted it (a done signal, a closed pipe or adapter) persists and is returned by
//! the next call.
//!
//! ```
//! use proxmox_cancel::Signal;
//! use proxmox_cancel_io::{pipe, CancelRead, CancelWrite};
//!
//! let (reader, writer) = pipe();
//! std::thread::scope(|s| {
//!     s.spawn(|| {
//!         writer.write(&Signal::new(), b"hello, world").unwrap();
//!         drop(writer);
//!     });
//!
//!     let mut buf = [0u8; 64];
//!     let got = reader.read(&Signal::new(), &mut buf).unwrap();
//!     assert_eq!(&buf[..got], b"hello, world");
//! });
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::sync::Arc;

pub use proxmox_cancel::{Reason, Signal};

mod error;
pub use error::{Error, PartialError, Result};

mod closer;

mod deadline;
pub use deadline::{Deadline, DeadlineReader, DeadlineWriter, SetReadDeadline, SetWriteDeadline};

mod proxy;
pub use proxy::{ProxyReader, ProxyWriter, DEFAULT_CHUNK_SIZE};

mod wrap;
pub use wrap::{
    wrap_deadline_reader, wrap_deadline_writer, wrap_reader, wrap_writer, CancelReader,
    CancelWriter,
};

mod pipe;
pub use pipe::{pipe, PipeReader, PipeWriter};

mod copy;
pub use copy::{copy, copy_buffer, write_str, DEFAULT_COPY_BUFFER_SIZE};

mod read;
pub use read::{read_all, read_at_least, read_full, read_to_end};

mod discard;
pub use discard::Discard;

mod direct;
pub use direct::{Direct, NopClose};

#[cfg(feature = "fd")]
mod fd;
#[cfg(feature = "fd")]
pub use fd::DeadlineFd;

/// Cancellation aware counterpart of [`std::io::Read`].
pub trait CancelRead {
    /// Read into `buf`, returning early if `signal` is done.
    ///
    /// Returns the number of bytes read, `Ok(0)` for a non-empty `buf` means end of data. If
    /// `signal` is already done when the call starts, nothing is read and its reason is
    /// returned.
    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize>;

    /// Bulk transfer capability: copy everything from `self` to `dst`.
    ///
    /// Returns `None` if the reader has no specialized implementation, in which case [`copy()`]
    /// falls back to its generic loop. A failure carries the number of bytes copied before it.
    fn write_to(
        &self,
        _signal: &Signal,
        _dst: &dyn CancelWrite,
    ) -> Option<Result<u64, PartialError>> {
        None
    }
}

/// Cancellation aware counterpart of [`std::io::Write`].
pub trait CancelWrite {
    /// Write `buf`, returning early if `signal` is done.
    ///
    /// Returns the number of bytes handed to the underlying handle. A short count means the
    /// call was interrupted, the next call reports why.
    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize>;

    /// Bulk transfer capability: copy everything from `src` into `self`.
    ///
    /// Returns `None` if the writer has no specialized implementation, in which case [`copy()`]
    /// falls back to its generic loop.
    fn read_from(
        &self,
        _signal: &Signal,
        _src: &dyn CancelRead,
    ) -> Option<Result<u64, PartialError>> {
        None
    }
}

/// Releases the resources of a reader or writer. Closing more than once is a no-op.
pub trait Close {
    fn close(&self) -> Result<()>;
}

macro_rules! forward_impls {
    ($($ty:ty),+) => {$(
        impl<T: CancelRead + ?Sized> CancelRead for $ty {
            fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
                (**self).read(signal, buf)
            }

            fn write_to(
                &self,
                signal: &Signal,
                dst: &dyn CancelWrite,
            ) -> Option<Result<u64, PartialError>> {
                (**self).write_to(signal, dst)
            }
        }

        impl<T: CancelWrite + ?Sized> CancelWrite for $ty {
            fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
                (**self).write(signal, buf)
            }

            fn read_from(
                &self,
                signal: &Signal,
                src: &dyn CancelRead,
            ) -> Option<Result<u64, PartialError>> {
                (**self).read_from(signal, src)
            }
        }

        impl<T: Close + ?Sized> Close for $ty {
            fn close(&self) -> Result<()> {
                (**self).close()
            }
        }
    )+};
}

forward_impls!(&T, Box<T>, Arc<T>);

/// The error for a call interrupted by `signal`.
pub(crate) fn canceled(signal: &Signal) -> Error {
    Error::Canceled(signal.reason().unwrap_or(Reason::Canceled))
}
