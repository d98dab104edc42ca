use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Instant;

use crossbeam_channel::{select, Receiver, Sender};

use proxmox_cancel::Signal;

use crate::closer::Closer;
use crate::{canceled, CancelWrite, Close, Error, Result};

/// Maximum amount of data handed to the worker thread at once.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

struct WriteRequest {
    buf: Vec<u8>,
}

struct WriteResponse {
    buf: Vec<u8>,
    written: usize,
    error: Option<Error>,
}

struct WriteState {
    chunk_size: usize,
    spare: Vec<Vec<u8>>,
    // a chunk was handed off but its response was not collected yet
    pending: bool,
    // error of a chunk which was already reported as written
    deferred: Option<Error>,
}

impl WriteState {
    fn fill(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buf = self.spare.pop().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(data);
        buf
    }
}

/// Cancellation aware writer for arbitrary blocking [`Write`] handles.
///
/// Data is copied to the worker thread in chunks of at most [`DEFAULT_CHUNK_SIZE`] bytes (see
/// [`with_chunk_size`](ProxyWriter::with_chunk_size)). A chunk accepted by the worker counts as
/// written: when the signal fires while the worker is still busy with it, the call returns the
/// count including that chunk, and the worker's result is collected by the next call.
///
/// ```
/// use proxmox_cancel::Signal;
/// use proxmox_cancel_io::{CancelWrite, ProxyWriter};
///
/// # fn code() -> Result<(), proxmox_cancel_io::Error> {
/// let writer = ProxyWriter::new(std::io::sink())?;
/// assert_eq!(writer.write(&Signal::new(), b"some data")?, 9);
/// # Ok(())
/// # }
/// # code().unwrap();
/// ```
pub struct ProxyWriter {
    state: Mutex<WriteState>,
    requests: Sender<WriteRequest>,
    responses: Receiver<WriteResponse>,
    closer: Closer,
}

impl ProxyWriter {
    /// Move `handle` to a new worker thread.
    pub fn new<W>(handle: W) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        Self::with_chunk_size(handle, DEFAULT_CHUNK_SIZE)
    }

    /// Like [`new`](ProxyWriter::new) with a custom chunk size.
    pub fn with_chunk_size<W>(handle: W, chunk_size: usize) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (requests, request_rx) = crossbeam_channel::bounded(0);
        let (response_tx, responses) = crossbeam_channel::bounded(0);
        let closer = Closer::new();

        let closed = closer.receiver().clone();
        std::thread::Builder::new()
            .name("cancel-write-proxy".to_string())
            .spawn(move || {
                log::debug!("write worker started");
                write_loop(handle, request_rx, response_tx, closed);
                log::debug!("write worker finished");
            })?;

        Ok(Self {
            state: Mutex::new(WriteState {
                chunk_size: chunk_size.max(1),
                spare: Vec::with_capacity(2),
                pending: false,
                deferred: None,
            }),
            requests,
            responses,
            closer,
        })
    }

    fn wait_response(&self, signal: &Signal, deadline: &Receiver<Instant>) -> Result<WriteResponse> {
        select! {
            recv(self.responses) -> res => res.map_err(|_| Error::Closed),
            recv(self.closer.receiver()) -> _ => Err(Error::Closed),
            recv(signal.cancel_channel()) -> _ => Err(canceled(signal)),
            recv(deadline) -> _ => Err(canceled(signal)),
        }
    }

    fn interruption(&self, signal: &Signal) -> Error {
        if self.closer.is_closed() {
            Error::Closed
        } else {
            canceled(signal)
        }
    }
}

impl CancelWrite for ProxyWriter {
    fn write(&self, signal: &Signal, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();

        if self.closer.is_closed() {
            return Err(Error::Closed);
        }

        if let Some(err) = state.deferred.take() {
            return Err(err);
        }

        signal.check()?;

        let deadline = signal.deadline_channel();

        if state.pending {
            let response = self.wait_response(signal, &deadline)?;
            state.pending = false;
            state.spare.push(response.buf);
            if let Some(err) = response.error {
                return Err(err);
            }
        }

        let mut written = 0;
        while written < data.len() {
            let end = data.len().min(written + state.chunk_size);
            let chunk = &data[written..end];

            let handed_off = select! {
                send(self.requests, WriteRequest { buf: state.fill(chunk) }) -> res => res.is_ok(),
                recv(self.closer.receiver()) -> _ => false,
                recv(signal.cancel_channel()) -> _ => false,
                recv(deadline) -> _ => false,
            };
            if !handed_off {
                return interrupted(written, self.interruption(signal));
            }

            state.pending = true;
            match self.wait_response(signal, &deadline) {
                Ok(response) => {
                    state.pending = false;
                    state.spare.push(response.buf);
                    if let Some(err) = response.error {
                        written += response.written;
                        if written > 0 {
                            state.deferred = Some(err);
                            return Ok(written);
                        }
                        return Err(err);
                    }
                    written = end;
                }
                Err(err) => {
                    // the worker owns the chunk now, it is written unless it reports an error
                    written = end;
                    return interrupted(written, err);
                }
            }
        }

        Ok(written)
    }
}

/// Closed adapters and done signals stay that way, so with partial progress the next call
/// reports the error.
fn interrupted(written: usize, err: Error) -> Result<usize> {
    if written > 0 {
        Ok(written)
    } else {
        Err(err)
    }
}

impl Close for ProxyWriter {
    fn close(&self) -> Result<()> {
        self.closer.close();
        Ok(())
    }
}

impl Drop for ProxyWriter {
    fn drop(&mut self) {
        self.closer.close();
    }
}

/// Write all of `buf`, returning how much was written before an error.
fn write_chunk<W: Write>(handle: &mut W, buf: &[u8]) -> (usize, Option<Error>) {
    let mut written = 0;
    while written < buf.len() {
        let remaining = buf.len() - written;
        match handle.write(&buf[written..]) {
            Ok(0) => return (written, Some(Error::ShortWrite)),
            Ok(n) if n > remaining => return (written, Some(Error::InvalidWrite)),
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return (written, Some(err.into())),
        }
    }
    (written, None)
}

fn write_loop<W: Write>(
    mut handle: W,
    requests: Receiver<WriteRequest>,
    responses: Sender<WriteResponse>,
    closed: Receiver<()>,
) {
    loop {
        let request = select! {
            recv(requests) -> request => match request {
                Ok(request) => request,
                Err(_) => return,
            },
            recv(closed) -> _ => return,
        };

        let (written, error) = write_chunk(&mut handle, &request.buf);
        let response = WriteResponse {
            buf: request.buf,
            written,
            error,
        };

        select! {
            send(responses, response) -> res => if res.is_err() {
                return;
            },
            recv(closed) -> _ => return,
        }
    }
}
