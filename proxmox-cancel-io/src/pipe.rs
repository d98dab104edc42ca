//! Synchronous in-memory pipe.

use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use crossbeam_channel::{select, Receiver, Sender};

use proxmox_cancel::Signal;

use crate::closer::Closer;
use crate::{canceled, CancelRead, CancelWrite, Close, Error, Result};

struct Shared {
    // unconsumed data of the writer currently blocked in `write`
    data_tx: Sender<Bytes>,
    data_rx: Receiver<Bytes>,
    // bytes the reader took from the last handoff
    consumed_tx: Sender<usize>,
    consumed_rx: Receiver<usize>,
    write_lock: Mutex<()>,
    done: Closer,
    // error of the read side, reported to writers
    read_error: OnceLock<Error>,
    // error of the write side, reported to readers
    write_error: OnceLock<Error>,
}

impl Shared {
    fn read_close_error(&self) -> Error {
        match (self.read_error.get(), self.write_error.get()) {
            (None, Some(err)) => err.clone(),
            _ => Error::ClosedPipe,
        }
    }

    fn write_close_error(&self) -> Error {
        match (self.write_error.get(), self.read_error.get()) {
            (None, Some(err)) => err.clone(),
            _ => Error::ClosedPipe,
        }
    }

    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
        if self.done.is_closed() {
            return Err(self.read_close_error());
        }

        signal.check()?;

        let deadline = signal.deadline_channel();
        select! {
            recv(self.data_rx) -> data => {
                let data = data.map_err(|_| Error::ClosedPipe)?;
                let len = buf.len().min(data.len());
                buf[..len].copy_from_slice(&data[..len]);
                // the writer waits for this, the slot is never occupied
                let _ = self.consumed_tx.send(len);
                Ok(len)
            }
            recv(self.done.receiver()) -> _ => Err(self.read_close_error()),
            recv(signal.cancel_channel()) -> _ => Err(canceled(signal)),
            recv(deadline) -> _ => Err(canceled(signal)),
        }
    }

    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap();

        if self.done.is_closed() {
            return Err(self.write_close_error());
        }

        signal.check()?;

        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = signal.deadline_channel();
        let data = Bytes::copy_from_slice(buf);
        let mut written = 0;

        while written < data.len() {
            let interruption = select! {
                send(self.data_tx, data.slice(written..)) -> res => match res {
                    Ok(()) => None,
                    Err(_) => Some(Error::ClosedPipe),
                },
                recv(self.done.receiver()) -> _ => Some(self.write_close_error()),
                recv(signal.cancel_channel()) -> _ => Some(canceled(signal)),
                recv(deadline) -> _ => Some(canceled(signal)),
            };

            if let Some(err) = interruption {
                if written > 0 {
                    log::trace!("pipe write interrupted after {written} bytes - {err}");
                    return Ok(written);
                }
                return Err(err);
            }

            match self.consumed_rx.recv() {
                Ok(len) => written += len,
                Err(_) => return Err(Error::ClosedPipe),
            }
        }

        Ok(written)
    }
}

/// Create a synchronous in-memory pipe.
///
/// Every write blocks until readers consumed all of its data or the write is interrupted.
/// There is no internal buffering, data is copied directly from the writer's buffer handoff
/// into the reader's buffer. A single write may be served by several reads.
///
/// Closing either end stops the transfer in both directions. Closing the reader with an error
/// makes writes fail with that error, closing the writer with an error makes reads fail with
/// it. Only the first close of an end records its error. Dropping an end closes it.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (data_tx, data_rx) = crossbeam_channel::bounded(0);
    let (consumed_tx, consumed_rx) = crossbeam_channel::bounded(1);

    let shared = Arc::new(Shared {
        data_tx,
        data_rx,
        consumed_tx,
        consumed_rx,
        write_lock: Mutex::new(()),
        done: Closer::new(),
        read_error: OnceLock::new(),
        write_error: OnceLock::new(),
    });

    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

/// The reading end of a [`pipe()`].
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Close the reader, writes fail with `err` from now on.
    ///
    /// Without an error writes fail with [`Error::ClosedPipe`]. Closing again does not replace
    /// the error.
    pub fn close_with_error(&self, err: Option<Error>) {
        let _ = self.shared.read_error.set(err.unwrap_or(Error::ClosedPipe));
        self.shared.done.close();
    }
}

impl CancelRead for PipeReader {
    /// Read data from the pipe, blocking until a writer provides data or the writer is closed.
    ///
    /// When the writer was closed without an error this returns `Ok(0)`.
    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
        match self.shared.read(signal, buf) {
            Err(Error::Eof) => Ok(0),
            other => other,
        }
    }
}

impl Close for PipeReader {
    fn close(&self) -> Result<()> {
        self.close_with_error(None);
        Ok(())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close_with_error(None);
    }
}

/// The writing end of a [`pipe()`].
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Close the writer, reads fail with `err` from now on.
    ///
    /// Without an error reads report the end of data. Closing again does not replace the error.
    pub fn close_with_error(&self, err: Option<Error>) {
        let _ = self.shared.write_error.set(err.unwrap_or(Error::Eof));
        self.shared.done.close();
    }
}

impl CancelWrite for PipeWriter {
    /// Write data to the pipe, blocking until readers consumed all of it or the pipe is closed.
    ///
    /// Returns the number of bytes consumed. If the write got interrupted after some data was
    /// consumed, that count is returned and the next write reports the reason.
    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
        self.shared.write(signal, buf)
    }
}

impl Close for PipeWriter {
    fn close(&self) -> Result<()> {
        self.close_with_error(None);
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close_with_error(None);
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::time::Duration;

    use proxmox_cancel::{Reason, Signal};

    use super::pipe;
    use crate::{CancelRead, CancelWrite, Close, Error};

    #[test]
    fn test_hello_world() {
        let (reader, writer) = pipe();

        std::thread::scope(|s| {
            let handle = s.spawn(|| writer.write(&Signal::new(), b"hello, world"));

            let mut buf = [0u8; 64];
            let got = reader.read(&Signal::new(), &mut buf).unwrap();
            assert_eq!(&buf[..got], b"hello, world");

            assert_eq!(handle.join().unwrap().unwrap(), 12);
        });
    }

    #[test]
    fn test_read_sizes() {
        let (reader, writer) = pipe();
        let data: Vec<u8> = (0..128u8).collect();

        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                let written = writer.write(&Signal::new(), &data);
                writer.close().unwrap();
                written
            });

            let mut remaining = data.len();
            let mut out = Vec::new();
            let mut buf = [0u8; 256];
            for size in [1, 2, 4, 8, 16, 32, 64, 128, 256] {
                let got = reader.read(&Signal::new(), &mut buf[..size]).unwrap();
                assert_eq!(got, size.min(remaining));
                remaining -= got;
                out.extend_from_slice(&buf[..got]);
            }
            assert_eq!(remaining, 0);
            assert_eq!(out, data);

            assert_eq!(handle.join().unwrap().unwrap(), 128);
        });
    }

    #[test]
    fn test_read_canceled() {
        let (reader, _writer) = pipe();
        let mut buf = [0u8; 8];

        let signal = Signal::with_timeout(Duration::from_millis(20));
        match reader.read(&signal, &mut buf) {
            Err(Error::Canceled(Reason::DeadlineExceeded)) => (),
            other => panic!("expected deadline exceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_close_writer_with_error() {
        let (reader, writer) = pipe();
        writer.close_with_error(Some(Error::other(io::Error::new(io::ErrorKind::Other, "gone"))));
        writer.close_with_error(Some(Error::ShortWrite));

        let mut buf = [0u8; 8];
        match reader.read(&Signal::new(), &mut buf) {
            Err(Error::Other(err)) => assert_eq!(err.to_string(), "gone"),
            other => panic!("expected recorded error, got {other:?}"),
        }
    }

    #[test]
    fn test_close_reader() {
        let (reader, writer) = pipe();
        reader.close().unwrap();
        reader.close().unwrap();

        assert!(matches!(
            writer.write(&Signal::new(), b"data"),
            Err(Error::ClosedPipe)
        ));

        // the reader closed itself
        let mut buf = [0u8; 8];
        assert!(matches!(
            reader.read(&Signal::new(), &mut buf),
            Err(Error::ClosedPipe)
        ));
    }

    #[test]
    fn test_empty_write() {
        let (_reader, writer) = pipe();
        assert_eq!(writer.write(&Signal::new(), b"").unwrap(), 0);
    }
}
