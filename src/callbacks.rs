//! Ordered callback buffering.
//!
//! Work is held back until some gating operation completes, then run in
//! arrival order. Engines also use a [`CallbackQueue`] to hold client
//! callbacks until their state lock is dropped.

use std::collections::VecDeque;
use std::fmt;

use crate::session::SessionId;

/// A deferred unit of work.
pub type Callback = Box<dyn FnOnce() + Send>;

/// FIFO of deferred callbacks.
#[derive(Default)]
pub struct CallbackQueue {
    callbacks: VecDeque<Callback>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback at the back of the queue.
    pub fn push<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.callbacks.push_back(Box::new(callback));
    }

    /// Take the oldest callback without running it.
    pub fn pop(&mut self) -> Option<Callback> {
        self.callbacks.pop_front()
    }

    /// Move every callback of `other` to the back of this queue.
    pub fn append(&mut self, other: &mut CallbackQueue) {
        self.callbacks.append(&mut other.callbacks);
    }

    /// Run every queued callback in insertion order, leaving the queue empty.
    pub fn run_all(&mut self) {
        while let Some(callback) = self.pop() {
            callback();
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("len", &self.callbacks.len())
            .finish()
    }
}

/// Holds session events back while a load for that session is in flight.
///
/// The engine may report key status changes for a session from inside the
/// call that restores it, before the application learned the session exists.
/// Those events are buffered here and fired once the load promise resolved.
#[derive(Debug)]
pub struct EventDeferrer {
    session_id: SessionId,
    pending: CallbackQueue,
}

impl EventDeferrer {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            pending: CallbackQueue::new(),
        }
    }

    /// Whether events for `session_id` must be held back.
    #[must_use]
    pub fn should_defer(&self, session_id: &SessionId) -> bool {
        self.session_id == *session_id
    }

    pub fn defer<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.push(callback);
    }

    /// Release the buffered events, in arrival order, into `queue`.
    pub fn fire(&mut self, queue: &mut CallbackQueue) {
        trace!(
            "Firing {} deferred event(s) for session {}",
            self.pending.len(),
            self.session_id.to_hex()
        );
        queue.append(&mut self.pending);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
