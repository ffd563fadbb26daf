//! The unit of work carried by a message queue

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::Location;
use std::time::Instant;

use crate::handler::{HandlerId, HandlerRef};

/// Opaque payload owned by a message until dispatched or disposed
pub type MessageData = Box<dyn Any + Send>;

/// Wildcard message id matching every message in `clear`
pub const MQID_ANY: u32 = u32::MAX;

/// A posted work item
///
/// A message without a handler is a dispose sentinel: it is never dispatched
/// and exists only so its payload is dropped on the consumer thread.
pub struct Message {
    /// Where the message was posted from
    pub posted_from: &'static Location<'static>,
    /// Target handler, `None` for a dispose sentinel
    pub handler: Option<HandlerRef>,
    /// Caller-defined id, matched by `clear`
    pub message_id: u32,
    /// Payload
    pub data: Option<MessageData>,
    /// Delivery deadline for time-sensitive messages
    pub ts_sensitive: Option<Instant>,
}

impl Message {
    /// Create a message with no latency deadline
    pub fn new(
        posted_from: &'static Location<'static>,
        handler: Option<HandlerRef>,
        message_id: u32,
        data: Option<MessageData>,
    ) -> Self {
        Self {
            posted_from,
            handler,
            message_id,
            data,
            ts_sensitive: None,
        }
    }

    /// Whether this is a dispose sentinel
    pub fn is_dispose(&self) -> bool {
        self.handler.is_none()
    }

    /// Identity of the target handler
    pub fn handler_id(&self) -> Option<HandlerId> {
        self.handler.as_ref().map(HandlerRef::id)
    }

    /// Match against a `clear` filter
    ///
    /// `handler = None` matches any handler (and dispose sentinels), `id =
    /// MQID_ANY` matches any id.
    pub fn matches(&self, handler: Option<HandlerId>, id: u32) -> bool {
        let handler_matches = match handler {
            None => true,
            Some(wanted) => self.handler_id() == Some(wanted),
        };
        handler_matches && (id == MQID_ANY || id == self.message_id)
    }

    /// Borrow the payload as `T`
    pub fn data_ref<T: Any>(&self) -> Option<&T> {
        self.data.as_deref()?.downcast_ref::<T>()
    }

    /// Mutably borrow the payload as `T`
    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_deref_mut()?.downcast_mut::<T>()
    }

    /// Take ownership of the payload if it is a `T`; otherwise leave it in place
    pub fn take_data<T: Any>(&mut self) -> Option<Box<T>> {
        let data = self.data.take()?;
        match data.downcast::<T>() {
            Ok(value) => Some(value),
            Err(data) => {
                self.data = Some(data);
                None
            }
        }
    }
}

/// Owned snapshot of a message's envelope, returned by `MessageQueue::peek`
///
/// The payload stays with the queued message; only its type is recorded.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub posted_from: &'static Location<'static>,
    pub handler: Option<HandlerRef>,
    pub message_id: u32,
    pub ts_sensitive: Option<Instant>,
    data_type: Option<TypeId>,
}

impl MessageInfo {
    /// Identity of the target handler
    pub fn handler_id(&self) -> Option<HandlerId> {
        self.handler.as_ref().map(HandlerRef::id)
    }

    pub fn has_data(&self) -> bool {
        self.data_type.is_some()
    }

    /// Whether the payload is a `T`
    pub fn data_is<T: Any>(&self) -> bool {
        self.data_type == Some(TypeId::of::<T>())
    }
}

impl Message {
    /// Snapshot everything but the payload
    pub fn info(&self) -> MessageInfo {
        MessageInfo {
            posted_from: self.posted_from,
            handler: self.handler.clone(),
            message_id: self.message_id,
            ts_sensitive: self.ts_sensitive,
            data_type: self.data.as_deref().map(|data| data.type_id()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("handler", &self.handler)
            .field("message_id", &self.message_id)
            .field("has_data", &self.data.is_some())
            .field("ts_sensitive", &self.ts_sensitive)
            .finish()
    }
}
