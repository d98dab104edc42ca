//! Wrappers which need no adapter thread.

use std::io::{self, Read, Write};
use std::sync::Mutex;

use proxmox_cancel::Signal;

use crate::{CancelRead, CancelWrite, Close, PartialError, Result};

/// Cancellation aware wrapper for in-memory readers and writers which never block, like
/// `Vec<u8>` or [`Cursor`](std::io::Cursor).
///
/// Calls are performed inline. A signal which is already done fails the call, otherwise it
/// completes regardless of the signal.
pub struct Direct<T> {
    inner: Mutex<T>,
}

impl<T> Direct<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap()
    }
}

impl<T: Read> CancelRead for Direct<T> {
    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
        signal.check()?;
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return Ok(other?),
            }
        }
    }
}

impl<T: Write> CancelWrite for Direct<T> {
    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
        signal.check()?;
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.write(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return Ok(other?),
            }
        }
    }
}

/// Forwards reads and writes to the inner value, but closing it does nothing.
///
/// Useful to hand out a reader or writer to code which closes it when done, while the owner
/// keeps using it.
pub struct NopClose<T> {
    inner: T,
}

impl<T> NopClose<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: CancelRead> CancelRead for NopClose<T> {
    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(signal, buf)
    }

    fn write_to(
        &self,
        signal: &Signal,
        dst: &dyn CancelWrite,
    ) -> Option<Result<u64, PartialError>> {
        self.inner.write_to(signal, dst)
    }
}

impl<T: CancelWrite> CancelWrite for NopClose<T> {
    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
        self.inner.write(signal, buf)
    }

    fn read_from(
        &self,
        signal: &Signal,
        src: &dyn CancelRead,
    ) -> Option<Result<u64, PartialError>> {
        self.inner.read_from(signal, src)
    }
}

impl<T> Close for NopClose<T> {
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use proxmox_cancel::{Reason, Signal};

    use super::{Direct, NopClose};
    use crate::{pipe, CancelRead, CancelWrite, Close, Error};

    #[test]
    fn test_direct_done_signal() {
        let direct = Direct::new(Vec::new());
        let signal = Signal::new();
        signal.cancel();
        assert!(matches!(
            direct.write(&signal, b"data"),
            Err(Error::Canceled(Reason::Canceled))
        ));
        assert!(direct.into_inner().is_empty());
    }

    #[test]
    fn test_nop_close() {
        let (reader, writer) = pipe();
        let reader = NopClose::new(reader);
        reader.close().unwrap();

        std::thread::scope(|s| {
            s.spawn(|| writer.write(&Signal::new(), b"still open").unwrap());

            let mut buf = [0u8; 32];
            let got = reader.read(&Signal::new(), &mut buf).unwrap();
            assert_eq!(&buf[..got], b"still open");
        });

        reader.get_ref().close().unwrap();
        let mut buf = [0u8; 32];
        assert!(matches!(
            reader.read(&Signal::new(), &mut buf),
            Err(Error::ClosedPipe)
        ));
    }
}
