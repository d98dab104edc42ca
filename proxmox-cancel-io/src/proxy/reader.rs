use std::io::{self, Read};
use std::sync::Mutex;

use crossbeam_channel::{select, Receiver, Sender};

use proxmox_cancel::Signal;

use crate::closer::Closer;
use crate::{canceled, CancelRead, Close, Error, Result};

struct ReadRequest {
    size: usize,
    spare: Option<Vec<u8>>,
}

struct ReadResponse {
    buf: Vec<u8>,
    result: io::Result<usize>,
}

/// Data of a response which did not fit into the caller's buffer.
#[derive(Default)]
struct Surplus {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Surplus {
    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn fill(&mut self, buf: Vec<u8>, len: usize) {
        self.end = len.min(buf.len());
        self.start = 0;
        self.buf = buf;
    }

    fn take_into(&mut self, dst: &mut [u8]) -> usize {
        let len = dst.len().min(self.end - self.start);
        dst[..len].copy_from_slice(&self.buf[self.start..(self.start + len)]);
        self.start += len;
        len
    }

    /// Hand out the drained buffer so the worker can reuse it.
    fn recycle(&mut self) -> Option<Vec<u8>> {
        self.start = 0;
        self.end = 0;
        if self.buf.capacity() == 0 {
            return None;
        }
        Some(std::mem::take(&mut self.buf))
    }
}

/// Cancellation aware reader for arbitrary blocking [`Read`] handles.
///
/// The handle is moved to a worker thread. A read canceled while the worker is blocked returns
/// right away; the worker's result is delivered to the next read, so no data is lost.
///
/// ```
/// use std::time::Duration;
///
/// use proxmox_cancel::Signal;
/// use proxmox_cancel_io::{CancelRead, ProxyReader};
///
/// # fn code() -> Result<(), proxmox_cancel_io::Error> {
/// let reader = ProxyReader::new(std::io::Cursor::new(b"some data".to_vec()))?;
///
/// let mut buf = [0u8; 4];
/// let got = reader.read(&Signal::with_timeout(Duration::from_secs(1)), &mut buf)?;
/// assert_eq!(&buf[..got], b"some");
/// # Ok(())
/// # }
/// # code().unwrap();
/// ```
pub struct ProxyReader {
    surplus: Mutex<Surplus>,
    requests: Sender<ReadRequest>,
    responses: Receiver<ReadResponse>,
    closer: Closer,
}

impl ProxyReader {
    /// Move `handle` to a new worker thread.
    pub fn new<R>(handle: R) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (requests, request_rx) = crossbeam_channel::bounded(0);
        let (response_tx, responses) = crossbeam_channel::bounded(0);
        let closer = Closer::new();

        let closed = closer.receiver().clone();
        std::thread::Builder::new()
            .name("cancel-read-proxy".to_string())
            .spawn(move || {
                log::debug!("read worker started");
                read_loop(handle, request_rx, response_tx, closed);
                log::debug!("read worker finished");
            })?;

        Ok(Self {
            surplus: Mutex::new(Surplus::default()),
            requests,
            responses,
            closer,
        })
    }
}

impl CancelRead for ProxyReader {
    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut surplus = self.surplus.lock().unwrap();

        // data already handed over stays readable after close
        if !surplus.is_empty() {
            return Ok(surplus.take_into(buf));
        }

        if self.closer.is_closed() {
            return Err(Error::Closed);
        }

        signal.check()?;

        let closed = self.closer.receiver();
        let deadline = signal.deadline_channel();

        let response = select! {
            send(self.requests, ReadRequest { size: buf.len(), spare: surplus.recycle() }) -> res => {
                res.map_err(|_| Error::Closed)?;
                select! {
                    recv(self.responses) -> res => res.map_err(|_| Error::Closed)?,
                    recv(closed) -> _ => return Err(Error::Closed),
                    recv(signal.cancel_channel()) -> _ => return Err(canceled(signal)),
                    recv(deadline) -> _ => return Err(canceled(signal)),
                }
            }
            // left over from a call which gave up waiting
            recv(self.responses) -> res => res.map_err(|_| Error::Closed)?,
            recv(closed) -> _ => return Err(Error::Closed),
            recv(signal.cancel_channel()) -> _ => return Err(canceled(signal)),
            recv(deadline) -> _ => return Err(canceled(signal)),
        };

        match response.result {
            Ok(len) => {
                surplus.fill(response.buf, len);
                Ok(surplus.take_into(buf))
            }
            Err(err) => {
                surplus.fill(response.buf, 0);
                Err(err.into())
            }
        }
    }
}

impl Close for ProxyReader {
    fn close(&self) -> Result<()> {
        self.closer.close();
        Ok(())
    }
}

impl Drop for ProxyReader {
    fn drop(&mut self) {
        self.closer.close();
    }
}

fn read_loop<R: Read>(
    mut handle: R,
    requests: Receiver<ReadRequest>,
    responses: Sender<ReadResponse>,
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

        let mut buf = request.spare.unwrap_or_default();
        buf.resize(request.size, 0);

        let result = loop {
            match handle.read(&mut buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        select! {
            send(responses, ReadResponse { buf, result }) -> res => if res.is_err() {
                return;
            },
            recv(closed) -> _ => return,
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::{Receiver, Sender};

    use proxmox_cancel::{Reason, Signal};

    use super::ProxyReader;
    use crate::{CancelRead, Close, Error};

    /// Blocking reader fed through a channel, end of data once the sender is gone.
    struct Feed(Receiver<Vec<u8>>, Vec<u8>);

    impl Read for Feed {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.1.is_empty() {
                match self.0.recv() {
                    Ok(data) => self.1 = data,
                    Err(_) => return Ok(0),
                }
            }
            let len = buf.len().min(self.1.len());
            buf[..len].copy_from_slice(&self.1[..len]);
            self.1.drain(..len);
            Ok(len)
        }
    }

    fn feed() -> (Sender<Vec<u8>>, ProxyReader) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let reader = ProxyReader::new(Feed(rx, Vec::new())).expect("failed to spawn worker");
        (tx, reader)
    }

    #[test]
    fn test_read() {
        let (tx, reader) = feed();
        tx.send(b"!".to_vec()).unwrap();

        let mut buf = [0u8; 128];
        let signal = Signal::with_timeout(Duration::from_secs(10));
        assert_eq!(reader.read(&signal, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'!');

        drop(tx);
        assert_eq!(reader.read(&signal, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_surplus() {
        let (tx, reader) = feed();

        // abandon a request for 16 bytes, its response is handed out in smaller pieces
        let mut big = [0u8; 16];
        let signal = Signal::with_timeout(Duration::from_millis(20));
        assert!(reader.read(&signal, &mut big).is_err());
        tx.send(b"abcdefghij".to_vec()).unwrap();

        let signal = Signal::new();
        let mut small = [0u8; 4];
        let mut out = Vec::new();
        while out.len() < 10 {
            let n = reader.read(&signal, &mut small).unwrap();
            assert!(n > 0);
            out.extend_from_slice(&small[..n]);
        }
        assert_eq!(out, b"abcdefghij");
    }

    #[test]
    fn test_surplus_after_close() {
        let (tx, reader) = feed();

        let mut big = [0u8; 16];
        let signal = Signal::with_timeout(Duration::from_millis(20));
        assert!(reader.read(&signal, &mut big).is_err());
        tx.send(b"abcdefghij".to_vec()).unwrap();

        let signal = Signal::new();
        let mut small = [0u8; 4];
        assert_eq!(reader.read(&signal, &mut small).unwrap(), 4);
        assert_eq!(&small, b"abcd");

        reader.close().unwrap();

        assert_eq!(reader.read(&signal, &mut small).unwrap(), 4);
        assert_eq!(&small, b"efgh");
        assert_eq!(reader.read(&signal, &mut small).unwrap(), 2);
        assert_eq!(&small[..2], b"ij");
        assert!(matches!(reader.read(&signal, &mut small), Err(Error::Closed)));
    }

    /// Counts the reads reaching the wrapped handle.
    struct Counting(Arc<AtomicUsize>);

    impl Read for Counting {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            buf.fill(b'x');
            Ok(buf.len())
        }
    }

    #[test]
    fn test_done_signal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reader = ProxyReader::new(Counting(Arc::clone(&calls))).unwrap();

        let signal = Signal::new();
        signal.cancel();

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            assert!(matches!(
                reader.read(&signal, &mut buf),
                Err(Error::Canceled(Reason::Canceled))
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(buf, [0u8; 16]);

        assert_eq!(reader.read(&Signal::new(), &mut buf).unwrap(), 16);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_then_retry() {
        let (tx, reader) = feed();

        let mut buf = [0u8; 128];
        let signal = Signal::with_timeout(Duration::from_millis(100));
        match reader.read(&signal, &mut buf) {
            Err(Error::Canceled(Reason::DeadlineExceeded)) => (),
            other => panic!("expected deadline exceeded, got {other:?}"),
        }

        // the worker is still blocked in the abandoned read, its result goes to the next call
        tx.send(b"late".to_vec()).unwrap();
        let n = reader
            .read(&Signal::with_timeout(Duration::from_secs(10)), &mut buf)
            .expect("retry failed");
        assert_eq!(&buf[..n], b"late");
    }

    #[test]
    fn test_close() {
        let (_tx, reader) = feed();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                reader.close().unwrap();
            });

            let mut buf = [0u8; 16];
            match reader.read(&Signal::new(), &mut buf) {
                Err(Error::Closed) => (),
                other => panic!("expected closed error, got {other:?}"),
            }
        });

        reader.close().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(reader.read(&Signal::new(), &mut buf), Err(Error::Closed)));
    }

    #[test]
    fn test_empty_buffer() {
        let (_tx, reader) = feed();
        assert_eq!(reader.read(&Signal::new(), &mut []).unwrap(), 0);
    }
}
