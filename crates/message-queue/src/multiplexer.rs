//! The wait/wakeup collaborator a queue suspends in
//!
//! A consumer blocked in `MessageQueue::get` parks inside
//! [`Multiplexer::wait`]; producers interrupt it with
//! [`Multiplexer::wake_up`]. Real deployments plug in a socket or event
//! multiplexer that also services I/O while waiting. Queues without one use
//! [`NullMultiplexer`].

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::queue::QueueId;

/// Blocking wait and wakeup for a message queue's consumer
pub trait Multiplexer: Send + Sync {
    /// Block for up to `timeout` (`None` = until woken), or until woken.
    ///
    /// When `process_io` is set the multiplexer may service I/O while
    /// waiting. Returning `false` aborts the calling `get`.
    fn wait(&self, timeout: Option<Duration>, process_io: bool) -> bool;

    /// Interrupt a blocked `wait`
    fn wake_up(&self);

    /// Bind to (or, with `None`, detach from) the queue that owns this
    /// multiplexer, for routing wakeups
    fn set_message_queue(&self, _queue: Option<QueueId>) {}
}

/// Multiplexer with no I/O, built on an auto-reset event
///
/// A wakeup that arrives while nobody is waiting is remembered, so the next
/// `wait` returns immediately and no wakeup is lost.
#[derive(Debug, Default)]
pub struct NullMultiplexer {
    signaled: Mutex<bool>,
    cond: Condvar,
    owner: Mutex<Option<QueueId>>,
}

impl NullMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue currently bound to this multiplexer
    pub fn message_queue(&self) -> Option<QueueId> {
        *self.owner.lock()
    }
}

impl Multiplexer for NullMultiplexer {
    fn wait(&self, timeout: Option<Duration>, _process_io: bool) -> bool {
        let mut signaled = self.signaled.lock();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut signaled),
            }
        }
        *signaled = false;
        true
    }

    fn wake_up(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    fn set_message_queue(&self, queue: Option<QueueId>) {
        trace!(?queue, "null multiplexer bound");
        *self.owner.lock() = queue;
    }
}
