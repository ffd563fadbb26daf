//! # Message-Queue: Threading Core for RVOIP
//!
//! Every long-lived component of the media stack (codec managers, jitter
//! buffers, audio processing chains, network I/O) runs on a thread that owns a
//! [`MessageQueue`]. Other threads hand it work by posting messages, either for
//! immediate dispatch or for a point in the future; the owning thread drains
//! its queue and dispatches each message to a [`MessageHandler`].
//!
//! ## Guarantees
//!
//! - **Ordering**: immediate messages are dispatched in posting order; delayed
//!   messages by trigger time, ties broken by posting order.
//! - **No lost wakeups**: every post wakes a consumer blocked in
//!   [`MessageQueue::get`].
//! - **No dispatch under lock**: handlers may post to or clear the queue that
//!   is dispatching them.
//! - **Exactly-once payload release**: a payload is either handed to its
//!   handler, returned from [`MessageQueue::clear`], or dropped once.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rvoip_message_queue::{HandlerRef, Message, MessageQueue};
//!
//! let queue = MessageQueue::new();
//! let handler = Arc::new(|msg: &mut Message| {
//!     let frames = msg.take_data::<Vec<i16>>().unwrap();
//!     assert_eq!(frames.len(), 160);
//! });
//!
//! queue.post(Some(HandlerRef::new(&handler)), 1, Some(Box::new(vec![0i16; 160])), false);
//! while let Some(msg) = queue.get(Some(Duration::ZERO), true) {
//!     queue.dispatch(msg);
//! }
//! ```
//!
//! [`MessageQueueManager`] tracks every live queue for handler cleanup and
//! provides [`MessageQueueManager::process_all_message_queues`], a barrier
//! that flushes all of them.

pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod manager;
pub mod message;
pub mod multiplexer;
pub mod queue;
pub mod time;

pub use config::{MessageQueueConfig, DEFAULT_MAX_MSG_LATENCY, DEFAULT_SLOW_DISPATCH_THRESHOLD};
pub use error::{Error, Result};
pub use handler::{HandlerId, HandlerRef, MessageHandler};
pub use manager::MessageQueueManager;
pub use message::{Message, MessageData, MessageInfo, MQID_ANY};
pub use multiplexer::{Multiplexer, NullMultiplexer};
pub use queue::{MessageQueue, MessageQueueBuilder, QueueId, QueueState, SyncCallHook};
pub use time::{Clock, FakeClock, SystemClock};

/// Version information for the message-queue library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
