use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

/// One-shot "closed" notification shared between an adapter and its background thread.
///
/// Closing drops the only sender, which makes every `recv` on the receiver (and every select
/// arm on it) return immediately from then on.
pub(crate) struct Closer {
    trigger: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

impl Closer {
    pub fn new() -> Self {
        let (trigger, closed) = crossbeam_channel::bounded(0);
        Self {
            trigger: Mutex::new(Some(trigger)),
            closed,
        }
    }

    /// Returns `true` for the call which actually closed.
    pub fn close(&self) -> bool {
        self.trigger.lock().unwrap().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.closed
    }
}
