//! Cancellation signal for blocking operations.
//!
//! A [`Signal`] carries an optional deadline and can be canceled explicitly. It is owned by the
//! caller and handed to blocking operations by reference; the operation observes it at its
//! suspension points by selecting on the channels exposed via [`Signal::cancel_channel`] and
//! [`Signal::deadline_channel`].
//!
//! ```
//! use std::time::Duration;
//!
//! use proxmox_cancel::{Reason, Signal};
//!
//! let signal = Signal::with_timeout(Duration::from_secs(30));
//! assert!(!signal.is_done());
//!
//! let other = signal.clone();
//! other.cancel();
//!
//! assert_eq!(signal.reason(), Some(Reason::Canceled));
//! assert!(signal.check().is_err());
//! ```

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

/// Why a [`Signal`] is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Reason {
    /// [`Signal::cancel`] was called.
    #[error("operation canceled")]
    Canceled,

    /// The signal's deadline has passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

struct Inner {
    deadline: Option<Instant>,
    reason: OnceLock<Reason>,
    // dropping the sender disconnects `canceled`
    trigger: Mutex<Option<Sender<()>>>,
    canceled: Receiver<()>,
}

/// A cancellation signal with an optional deadline.
///
/// Cloning is cheap and all clones share the same state, so one clone can be handed to another
/// thread to cancel operations waiting on the others. Once done, a signal stays done and its
/// [`Reason`] never changes.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<Inner>,
}

impl Signal {
    /// Create a signal which is only done once [`cancel`](Signal::cancel) is called.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a signal which is done at `deadline` at the latest.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    /// Create a signal which is done after `timeout` at the latest.
    ///
    /// A timeout too large to be represented never expires.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout))
    }

    fn build(deadline: Option<Instant>) -> Self {
        let (trigger, canceled) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                deadline,
                reason: OnceLock::new(),
                trigger: Mutex::new(Some(trigger)),
                canceled,
            }),
        }
    }

    /// Cancel the signal. Calling this more than once has no further effect.
    ///
    /// If the deadline has already passed, the reason stays [`Reason::DeadlineExceeded`].
    pub fn cancel(&self) {
        let reason = if self.deadline_passed() {
            Reason::DeadlineExceeded
        } else {
            Reason::Canceled
        };
        let _ = self.inner.reason.set(reason);
        drop(self.inner.trigger.lock().unwrap().take());
    }

    /// The deadline of this signal, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// The time left until the deadline, `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn deadline_passed(&self) -> bool {
        matches!(self.inner.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// The reason this signal is done, or `None` if it is not done yet.
    pub fn reason(&self) -> Option<Reason> {
        if let Some(reason) = self.inner.reason.get() {
            return Some(*reason);
        }

        if self.deadline_passed() {
            return Some(*self.inner.reason.get_or_init(|| Reason::DeadlineExceeded));
        }

        None
    }

    /// Whether the signal is done.
    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    /// Shortcut for returning the reason as an error if the signal is done.
    pub fn check(&self) -> Result<(), Reason> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// A channel which becomes disconnected once the signal is canceled explicitly.
    ///
    /// Nothing is ever sent over it, a `recv` on it only returns once [`cancel`](Signal::cancel)
    /// has been called. Use together with [`deadline_channel`](Signal::deadline_channel) in a
    /// `select!`.
    pub fn cancel_channel(&self) -> &Receiver<()> {
        &self.inner.canceled
    }

    /// A channel which delivers a message once the deadline is reached. Never delivers anything
    /// for signals without deadline.
    pub fn deadline_channel(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }

    /// Block the current thread until the signal is done.
    pub fn wait(&self) -> Reason {
        let deadline = self.deadline_channel();
        crossbeam_channel::select! {
            recv(self.cancel_channel()) -> _ => (),
            recv(deadline) -> _ => (),
        }
        self.reason().unwrap_or(Reason::Canceled)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("deadline", &self.inner.deadline)
            .field("reason", &self.inner.reason.get())
            .finish()
    }
}
