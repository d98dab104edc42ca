//! Picking an adapter strategy for a blocking handle.

use std::io::{self, Read, Write};

use proxmox_cancel::Signal;

use crate::deadline::{Deadline, DeadlineReader, DeadlineWriter, SetReadDeadline, SetWriteDeadline};
use crate::proxy::{ProxyReader, ProxyWriter};
use crate::{CancelRead, CancelWrite, Close, Result};

/// Make a plain blocking reader cancellation aware by moving it to a worker thread.
pub fn wrap_reader<R>(handle: R) -> Result<ProxyReader>
where
    R: Read + Send + 'static,
{
    ProxyReader::new(handle)
}

/// Make a plain blocking writer cancellation aware by moving it to a worker thread.
pub fn wrap_writer<W>(handle: W) -> Result<ProxyWriter>
where
    W: Write + Send + 'static,
{
    ProxyWriter::new(handle)
}

/// Make a reader with deadline support cancellation aware.
///
/// Some handles implement [`SetReadDeadline`] but fail at runtime (for instance a file
/// descriptor which cannot be polled). The handle's deadline is set to [`Deadline::Never`] once
/// to find out: if that works, the returned reader expires the deadline on cancellation,
/// otherwise the handle is moved to a worker thread.
pub fn wrap_deadline_reader<H>(handle: H) -> Result<CancelReader<H>>
where
    H: SetReadDeadline + Send + Sync + 'static,
    for<'a> &'a H: Read,
{
    match handle.set_read_deadline(Deadline::Never) {
        Ok(()) => Ok(CancelReader::Deadline(DeadlineReader::new(handle)?)),
        Err(err) => {
            log::debug!("read deadline not supported, using worker thread - {err}");
            Ok(CancelReader::Proxy(ProxyReader::new(ByRef(handle))?))
        }
    }
}

/// Make a writer with deadline support cancellation aware, see [`wrap_deadline_reader`].
pub fn wrap_deadline_writer<H>(handle: H) -> Result<CancelWriter<H>>
where
    H: SetWriteDeadline + Send + Sync + 'static,
    for<'a> &'a H: Write,
{
    match handle.set_write_deadline(Deadline::Never) {
        Ok(()) => Ok(CancelWriter::Deadline(DeadlineWriter::new(handle)?)),
        Err(err) => {
            log::debug!("write deadline not supported, using worker thread - {err}");
            Ok(CancelWriter::Proxy(ProxyWriter::new(ByRef(handle))?))
        }
    }
}

/// Owned handle doing its I/O through a shared reference.
struct ByRef<H>(H);

impl<H> Read for ByRef<H>
where
    for<'a> &'a H: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl<H> Write for ByRef<H>
where
    for<'a> &'a H: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.0).flush()
    }
}

/// The reader chosen by [`wrap_deadline_reader`].
pub enum CancelReader<H> {
    Deadline(DeadlineReader<H>),
    Proxy(ProxyReader),
}

impl<H> CancelReader<H> {
    /// Whether reads are interrupted through the handle's deadline.
    pub fn uses_deadline(&self) -> bool {
        matches!(self, CancelReader::Deadline(_))
    }
}

impl<H> CancelRead for CancelReader<H>
where
    H: SetReadDeadline,
    for<'a> &'a H: Read,
{
    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
        match self {
            CancelReader::Deadline(reader) => reader.read(signal, buf),
            CancelReader::Proxy(reader) => reader.read(signal, buf),
        }
    }
}

impl<H> Close for CancelReader<H> {
    fn close(&self) -> Result<()> {
        match self {
            CancelReader::Deadline(reader) => reader.close(),
            CancelReader::Proxy(reader) => reader.close(),
        }
    }
}

/// The writer chosen by [`wrap_deadline_writer`].
pub enum CancelWriter<H> {
    Deadline(DeadlineWriter<H>),
    Proxy(ProxyWriter),
}

impl<H> CancelWriter<H> {
    /// Whether writes are interrupted through the handle's deadline.
    pub fn uses_deadline(&self) -> bool {
        matches!(self, CancelWriter::Deadline(_))
    }
}

impl<H> CancelWrite for CancelWriter<H>
where
    H: SetWriteDeadline,
    for<'a> &'a H: Write,
{
    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
        match self {
            CancelWriter::Deadline(writer) => writer.write(signal, buf),
            CancelWriter::Proxy(writer) => writer.write(signal, buf),
        }
    }
}

impl<H> Close for CancelWriter<H> {
    fn close(&self) -> Result<()> {
        match self {
            CancelWriter::Deadline(writer) => writer.close(),
            CancelWriter::Proxy(writer) => writer.close(),
        }
    }
}
