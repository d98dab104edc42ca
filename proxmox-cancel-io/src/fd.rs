//! Deadline support for file descriptors.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::time::Instant;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::deadline::{Deadline, SetReadDeadline, SetWriteDeadline};

/// Deadline of one direction plus the socket pair used to wake up a call waiting for it.
struct Direction {
    deadline: Mutex<Deadline>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

impl Direction {
    fn new() -> io::Result<Self> {
        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            deadline: Mutex::new(Deadline::Never),
            wake_rx,
            wake_tx,
        })
    }

    fn set(&self, deadline: Deadline) -> io::Result<()> {
        *self.deadline.lock().unwrap() = deadline;
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => Ok(()),
            // a wake up is pending already
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wake_rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    fn timeout(&self) -> io::Result<PollTimeout> {
        match *self.deadline.lock().unwrap() {
            Deadline::Never => Ok(PollTimeout::NONE),
            Deadline::Expired => Err(timed_out()),
            Deadline::At(at) => {
                let now = Instant::now();
                if at <= now {
                    return Err(timed_out());
                }
                // round up, waking early would only spin
                let millis = (at - now).as_nanos().div_ceil(1_000_000);
                let millis = i32::try_from(millis).unwrap_or(i32::MAX);
                Ok(PollTimeout::try_from(millis).unwrap_or(PollTimeout::NONE))
            }
        }
    }

    /// Run `op` until it stops failing with `EAGAIN`, waiting for `events` on `fd` in between.
    fn run<T>(
        &self,
        fd: BorrowedFd,
        events: PollFlags,
        mut op: impl FnMut() -> nix::Result<T>,
    ) -> io::Result<T> {
        loop {
            let timeout = self.timeout()?;

            match op() {
                Ok(value) => return Ok(value),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => (),
                Err(err) => return Err(err.into()),
            }

            let mut fds = [
                PollFd::new(fd, events),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(_) | Err(Errno::EINTR) => (),
                Err(err) => return Err(err.into()),
            }

            if fds[1].any().unwrap_or(false) {
                self.drain();
            }
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline reached")
}

/// A file descriptor in non-blocking mode with read and write deadlines.
///
/// Reads and writes wait for the descriptor with `poll(2)`, so they can be cut short by
/// changing the deadline from another thread. This makes pipes, sockets and terminals usable
/// with [`DeadlineReader`](crate::DeadlineReader) and [`DeadlineWriter`](crate::DeadlineWriter).
///
/// ```no_run
/// use std::time::Duration;
///
/// use proxmox_cancel::Signal;
/// use proxmox_cancel_io::{wrap_deadline_reader, CancelRead, DeadlineFd};
///
/// # fn code() -> Result<(), proxmox_cancel_io::Error> {
/// let (a, _b) = std::os::unix::net::UnixStream::pair()?;
/// let reader = wrap_deadline_reader(DeadlineFd::new(a)?)?;
///
/// let mut buf = [0u8; 64];
/// let res = reader.read(&Signal::with_timeout(Duration::from_millis(100)), &mut buf);
/// assert!(res.unwrap_err().is_canceled());
/// # Ok(())
/// # }
/// ```
pub struct DeadlineFd<F> {
    fd: F,
    read: Direction,
    write: Direction,
}

impl<F: AsFd> DeadlineFd<F> {
    /// Switch `fd` to non-blocking mode and take it over.
    pub fn new(fd: F) -> io::Result<Self> {
        let raw = fd.as_fd().as_raw_fd();
        let flags = OFlag::from_bits_retain(fcntl(raw, FcntlArg::F_GETFL)?);
        fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

        Ok(Self {
            fd,
            read: Direction::new()?,
            write: Direction::new()?,
        })
    }

    pub fn get_ref(&self) -> &F {
        &self.fd
    }

    pub fn into_inner(self) -> F {
        self.fd
    }
}

impl<F: AsFd> SetReadDeadline for DeadlineFd<F> {
    fn set_read_deadline(&self, deadline: Deadline) -> io::Result<()> {
        self.read.set(deadline)
    }
}

impl<F: AsFd> SetWriteDeadline for DeadlineFd<F> {
    fn set_write_deadline(&self, deadline: Deadline) -> io::Result<()> {
        self.write.set(deadline)
    }
}

impl<F: AsFd> Read for &DeadlineFd<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd.as_fd();
        self.read.run(fd, PollFlags::POLLIN, || {
            nix::unistd::read(fd.as_raw_fd(), buf)
        })
    }
}

impl<F: AsFd> Write for &DeadlineFd<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.fd.as_fd();
        self.write.run(fd, PollFlags::POLLOUT, || nix::unistd::write(fd, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F: AsFd> Read for DeadlineFd<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl<F: AsFd> Write for DeadlineFd<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use super::DeadlineFd;
    use crate::deadline::{Deadline, SetReadDeadline};

    #[test]
    fn test_read_write() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = DeadlineFd::new(a).unwrap();
        let b = DeadlineFd::new(b).unwrap();

        assert_eq!((&a).write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        let n = (&b).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_deadline() {
        let (a, _b) = UnixStream::pair().unwrap();
        let a = DeadlineFd::new(a).unwrap();

        a.set_read_deadline(Deadline::At(Instant::now() + Duration::from_millis(30)))
            .unwrap();
        let mut buf = [0u8; 8];
        let err = (&a).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_expire_while_waiting() {
        let (a, _b) = UnixStream::pair().unwrap();
        let a = DeadlineFd::new(a).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                a.set_read_deadline(Deadline::Expired).unwrap();
            });

            let mut buf = [0u8; 8];
            let err = (&a).read(&mut buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        });
    }
}
