//! Adapters for handles which can change their I/O deadline while an operation is in flight.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{select, Receiver, Sender};

use proxmox_cancel::{Reason, Signal};

use crate::closer::Closer;
use crate::{CancelRead, CancelWrite, Close, Error, Result};

/// An I/O deadline for a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    /// Operations never time out.
    Never,

    /// Operations fail with a timeout once this instant is reached.
    At(Instant),

    /// A deadline in the past: operations in flight and new operations fail right away.
    Expired,
}

/// Handles whose read deadline can be changed, also while a read is in progress.
///
/// Changing the deadline must affect a read which is already blocked, that's what makes it
/// usable to interrupt the read.
pub trait SetReadDeadline {
    fn set_read_deadline(&self, deadline: Deadline) -> io::Result<()>;
}

/// Handles whose write deadline can be changed, also while a write is in progress.
pub trait SetWriteDeadline {
    fn set_write_deadline(&self, deadline: Deadline) -> io::Result<()>;
}

impl<T: SetReadDeadline + ?Sized> SetReadDeadline for Arc<T> {
    fn set_read_deadline(&self, deadline: Deadline) -> io::Result<()> {
        (**self).set_read_deadline(deadline)
    }
}

impl<T: SetWriteDeadline + ?Sized> SetWriteDeadline for Arc<T> {
    fn set_write_deadline(&self, deadline: Deadline) -> io::Result<()> {
        (**self).set_write_deadline(deadline)
    }
}

#[derive(Default)]
struct WatchState {
    // reason recorded by the watcher for the current call
    reason: Option<Reason>,
    // the handle's deadline was forced to `Deadline::Expired` and needs a reset
    forced: bool,
}

/// Caller side of the watcher thread.
///
/// For every call the signal is handed to the watcher thread, which expires the handle's
/// deadline if the signal fires before the call reports back as finished.
struct Watcher {
    calls: Mutex<()>,
    state: Arc<Mutex<WatchState>>,
    signals: Sender<Signal>,
    finished: Sender<()>,
    closer: Closer,
}

impl Watcher {
    fn spawn<F>(name: &str, expire: F) -> io::Result<Self>
    where
        F: Fn() -> io::Result<()> + Send + 'static,
    {
        let (signals, signal_rx) = crossbeam_channel::bounded(1);
        let (finished, finished_rx) = crossbeam_channel::bounded(0);
        let closer = Closer::new();
        let state = Arc::new(Mutex::new(WatchState::default()));

        let closed = closer.receiver().clone();
        let thread_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::debug!("deadline watcher started");
                watch(signal_rx, finished_rx, closed, thread_state, expire);
                log::debug!("deadline watcher finished");
            })?;

        Ok(Self {
            calls: Mutex::new(()),
            state,
            signals,
            finished,
            closer,
        })
    }

    fn run<T, R, O>(&self, signal: &Signal, reset: R, op: O) -> Result<T>
    where
        R: FnOnce() -> io::Result<()>,
        O: FnOnce() -> io::Result<T>,
    {
        let _guard = self.calls.lock().unwrap();

        if self.closer.is_closed() {
            return Err(Error::Closed);
        }

        signal.check()?;

        {
            let mut state = self.state.lock().unwrap();
            state.reason = None;
            if std::mem::take(&mut state.forced) {
                reset()?;
            }
        }

        select! {
            send(self.signals, signal.clone()) -> res => res.map_err(|_| Error::Closed)?,
            recv(self.closer.receiver()) -> _ => return Err(Error::Closed),
        }

        let result = op().map_err(|err| match self.state.lock().unwrap().reason {
            Some(reason) => {
                log::trace!("replacing '{err}' with cancellation reason");
                Error::from(reason)
            }
            None => Error::from(err),
        });

        select! {
            send(self.finished, ()) -> _ => (),
            recv(self.closer.receiver()) -> _ => (),
        }

        result
    }

    fn close(&self) {
        self.closer.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.closer.close();
    }
}

fn watch<F>(
    signals: Receiver<Signal>,
    finished: Receiver<()>,
    closed: Receiver<()>,
    state: Arc<Mutex<WatchState>>,
    expire: F,
) where
    F: Fn() -> io::Result<()>,
{
    loop {
        let signal = select! {
            recv(signals) -> signal => match signal {
                Ok(signal) => signal,
                Err(_) => return,
            },
            recv(closed) -> _ => return,
        };

        let mut canceled = signal.cancel_channel().clone();
        let mut deadline = signal.deadline_channel();

        loop {
            let fired = select! {
                recv(canceled) -> _ => true,
                recv(deadline) -> _ => true,
                recv(finished) -> msg => match msg {
                    Ok(()) => break,
                    Err(_) => return,
                },
                recv(closed) -> _ => return,
            };

            if fired {
                let reason = signal.reason().unwrap_or(Reason::Canceled);
                log::trace!("in-flight call canceled: {reason}");
                {
                    let mut state = state.lock().unwrap();
                    state.reason = Some(reason);
                    state.forced = true;
                }
                if let Err(err) = expire() {
                    log::warn!("failed to expire deadline of canceled call - {err}");
                }
                // only wait for the call to finish from now on
                canceled = crossbeam_channel::never();
                deadline = crossbeam_channel::never();
            }
        }
    }
}

/// Cancellation aware reader for handles implementing [`SetReadDeadline`].
///
/// The caller performs the read directly on the handle; a watcher thread expires the handle's
/// read deadline if the signal fires during the read. Use
/// [`wrap_deadline_reader`](crate::wrap_deadline_reader) to check whether a handle actually
/// supports deadlines before settling on this strategy.
pub struct DeadlineReader<H> {
    handle: Arc<H>,
    watcher: Watcher,
}

impl<H> DeadlineReader<H>
where
    H: SetReadDeadline + Send + Sync + 'static,
    for<'a> &'a H: Read,
{
    pub fn new(handle: H) -> Result<Self> {
        let handle = Arc::new(handle);
        let expire = {
            let handle = Arc::clone(&handle);
            move || handle.set_read_deadline(Deadline::Expired)
        };
        let watcher = Watcher::spawn("cancel-read-watch", expire)?;
        Ok(Self { handle, watcher })
    }
}

impl<H> DeadlineReader<H> {
    /// Access the wrapped handle.
    pub fn get_ref(&self) -> &H {
        &self.handle
    }
}

impl<H> CancelRead for DeadlineReader<H>
where
    H: SetReadDeadline,
    for<'a> &'a H: Read,
{
    fn read(&self, signal: &Signal, buf: &mut [u8]) -> Result<usize> {
        let handle: &H = &self.handle;
        self.watcher.run(
            signal,
            || handle.set_read_deadline(Deadline::Never),
            || {
                let mut handle = handle;
                loop {
                    match handle.read(buf) {
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        other => return other,
                    }
                }
            },
        )
    }
}

impl<H> Close for DeadlineReader<H> {
    fn close(&self) -> Result<()> {
        self.watcher.close();
        Ok(())
    }
}

/// Cancellation aware writer for handles implementing [`SetWriteDeadline`].
///
/// Each call performs a single write on the handle, so like [`std::io::Write::write`] it may
/// write only part of the buffer.
pub struct DeadlineWriter<H> {
    handle: Arc<H>,
    watcher: Watcher,
}

impl<H> DeadlineWriter<H>
where
    H: SetWriteDeadline + Send + Sync + 'static,
    for<'a> &'a H: Write,
{
    pub fn new(handle: H) -> Result<Self> {
        let handle = Arc::new(handle);
        let expire = {
            let handle = Arc::clone(&handle);
            move || handle.set_write_deadline(Deadline::Expired)
        };
        let watcher = Watcher::spawn("cancel-write-watch", expire)?;
        Ok(Self { handle, watcher })
    }
}

impl<H> DeadlineWriter<H> {
    /// Access the wrapped handle.
    pub fn get_ref(&self) -> &H {
        &self.handle
    }
}

impl<H> CancelWrite for DeadlineWriter<H>
where
    H: SetWriteDeadline,
    for<'a> &'a H: Write,
{
    fn write(&self, signal: &Signal, buf: &[u8]) -> Result<usize> {
        let handle: &H = &self.handle;
        let written = self.watcher.run(
            signal,
            || handle.set_write_deadline(Deadline::Never),
            || {
                let mut handle = handle;
                loop {
                    match handle.write(buf) {
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        other => return other,
                    }
                }
            },
        )?;

        if written > buf.len() {
            return Err(Error::InvalidWrite);
        }
        Ok(written)
    }
}

impl<H> Close for DeadlineWriter<H> {
    fn close(&self) -> Result<()> {
        self.watcher.close();
        Ok(())
    }
}
