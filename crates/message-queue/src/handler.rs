//! Message handler contract
//!
//! Queues never own their handlers. A posted [`Message`] holds a
//! [`HandlerRef`], a weak reference that is upgraded only for the duration of a
//! dispatch. Handlers are matched for clearing by their [`HandlerId`], the
//! address of the handler object, which stays valid inside the handler's own
//! `Drop` so a handler can purge itself from every queue as it goes away:
//!
//! ```rust,ignore
//! impl Drop for StatsReporter {
//!     fn drop(&mut self) {
//!         MessageQueueManager::global().clear(HandlerId::of(self));
//!     }
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use crate::message::Message;

/// Callback target for dispatched messages
///
/// `on_message` runs on the consumer thread with no queue lock held, so it may
/// freely post to or clear any queue, including the one dispatching it.
pub trait MessageHandler: Send + Sync {
    /// Handle a dispatched message. The handler may take the payload.
    fn on_message(&self, msg: &mut Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&mut Message) + Send + Sync,
{
    fn on_message(&self, msg: &mut Message) {
        self(msg)
    }
}

/// Identity of a handler object, used to match messages in `clear`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(usize);

impl HandlerId {
    /// Identity of the handler behind `handler`
    pub fn of<H: MessageHandler + ?Sized>(handler: &H) -> Self {
        HandlerId(handler as *const H as *const () as usize)
    }
}

/// Non-owning reference to a handler, carried by posted messages
#[derive(Clone)]
pub struct HandlerRef {
    handler: Weak<dyn MessageHandler>,
    id: HandlerId,
}

impl HandlerRef {
    /// Reference a concrete handler
    pub fn new<H: MessageHandler + 'static>(handler: &Arc<H>) -> Self {
        let weak: Weak<H> = Arc::downgrade(handler);
        let weak: Weak<dyn MessageHandler> = weak;
        Self {
            handler: weak,
            id: HandlerId::of(handler.as_ref()),
        }
    }

    /// Reference a handler that is already type-erased
    pub fn from_dyn(handler: &Arc<dyn MessageHandler>) -> Self {
        Self {
            handler: Arc::downgrade(handler),
            id: HandlerId::of(handler.as_ref()),
        }
    }

    /// Identity of the referenced handler
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Upgrade to a strong reference if the handler is still alive
    pub fn upgrade(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.upgrade()
    }

    /// Whether the handler has been dropped
    pub fn is_dangling(&self) -> bool {
        self.handler.strong_count() == 0
    }
}

impl<H: MessageHandler + 'static> From<&Arc<H>> for HandlerRef {
    fn from(handler: &Arc<H>) -> Self {
        HandlerRef::new(handler)
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRef")
            .field("id", &self.id)
            .field("alive", &!self.is_dangling())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(AtomicU32);

    impl MessageHandler for Counter {
        fn on_message(&self, msg: &mut Message) {
            self.0.fetch_add(msg.message_id, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_handler_id_is_stable_across_refs() {
        let handler = Arc::new(Counter(AtomicU32::new(0)));
        let a = HandlerRef::new(&handler);
        let b = HandlerRef::from(&handler);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), HandlerId::of(handler.as_ref()));

        let erased: Arc<dyn MessageHandler> = handler.clone();
        assert_eq!(HandlerRef::from_dyn(&erased).id(), a.id());
    }

    #[test]
    fn test_distinct_handlers_have_distinct_ids() {
        let h1 = Arc::new(Counter(AtomicU32::new(0)));
        let h2 = Arc::new(Counter(AtomicU32::new(0)));
        assert_ne!(HandlerRef::new(&h1).id(), HandlerRef::new(&h2).id());
    }

    #[test]
    fn test_ref_does_not_keep_handler_alive() {
        let handler = Arc::new(Counter(AtomicU32::new(0)));
        let handler_ref = HandlerRef::new(&handler);
        assert!(handler_ref.upgrade().is_some());

        drop(handler);
        assert!(handler_ref.is_dangling());
        assert!(handler_ref.upgrade().is_none());
    }

    #[test]
    fn test_closure_handler() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        let handler = Arc::new(move |msg: &mut Message| {
            seen_clone.store(msg.message_id, Ordering::SeqCst);
        });
        let handler_ref = HandlerRef::new(&handler);

        let mut msg = Message::new(
            std::panic::Location::caller(),
            Some(handler_ref.clone()),
            7,
            None,
        );
        handler_ref.upgrade().unwrap().on_message(&mut msg);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
