//! The per-owner event loop
//!
//! A [`MessageQueue`] holds an immediate FIFO and a delayed min-heap behind a
//! single lock. Any thread may post into it; the owning thread drains it with
//! [`MessageQueue::get`] and runs each message with
//! [`MessageQueue::dispatch`]:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rvoip_message_queue::MessageQueue;
//!
//! let queue = MessageQueue::new();
//! while let Some(msg) = queue.get(Some(Duration::from_millis(100)), true) {
//!     queue.dispatch(msg);
//! }
//! ```
//!
//! The lock is only held while a container is touched. Handlers, payload
//! destructors, and the multiplexer wait all run without it, so handlers can
//! post to or clear the queue that is dispatching them.

mod delayed;

use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::MessageQueueConfig;
use crate::handler::{HandlerId, HandlerRef};
use crate::manager::MessageQueueManager;
use crate::message::{Message, MessageData, MessageInfo};
use crate::multiplexer::{Multiplexer, NullMultiplexer};
use crate::time::{time_diff, Clock, SystemClock};

use self::delayed::DelayedMessage;

/// Hook draining synchronous cross-thread calls, run at the top of every
/// `get` iteration
pub type SyncCallHook = Arc<dyn Fn() + Send + Sync>;

type DestroyedCallback = Box<dyn FnOnce(QueueId) + Send>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle identifying a queue to the manager and its multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mq-{}", self.0)
    }
}

/// Lifecycle state of a live queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Built but not yet registered with its manager
    Created,
    /// Registered and serving `get`
    Active,
    /// `quit` has been called; posts are dropped
    Quitting,
}

/// Containers guarded by the queue lock
#[derive(Default)]
struct Queues {
    msgq: VecDeque<Message>,
    dmsgq: BinaryHeap<DelayedMessage>,
    dmsgq_next_num: u64,
    peeked: Option<Message>,
}

impl Queues {
    fn len(&self) -> usize {
        self.msgq.len() + self.dmsgq.len() + usize::from(self.peeked.is_some())
    }

    /// Remove every matching message, in peek, FIFO, delayed order
    fn extract(&mut self, handler: Option<HandlerId>, id: u32) -> Vec<Message> {
        let mut removed = Vec::new();

        if self
            .peeked
            .as_ref()
            .is_some_and(|msg| msg.matches(handler, id))
        {
            removed.extend(self.peeked.take());
        }

        let mut kept = VecDeque::with_capacity(self.msgq.len());
        for msg in self.msgq.drain(..) {
            if msg.matches(handler, id) {
                removed.push(msg);
            } else {
                kept.push_back(msg);
            }
        }
        self.msgq = kept;

        let mut kept = Vec::with_capacity(self.dmsgq.len());
        for delayed in std::mem::take(&mut self.dmsgq).into_vec() {
            if delayed.msg.matches(handler, id) {
                removed.push(delayed.msg);
            } else {
                kept.push(delayed);
            }
        }
        self.dmsgq = BinaryHeap::from(kept);

        removed
    }
}

/// State shared between a queue's owner and the manager's registry
pub(crate) struct QueueCore {
    id: QueueId,
    config: MessageQueueConfig,
    clock: Arc<dyn Clock>,
    queues: Mutex<Queues>,
    stop: AtomicBool,
    initialized: AtomicBool,
    multiplexer: RwLock<Arc<dyn Multiplexer>>,
    default_multiplexer: Arc<dyn Multiplexer>,
    sync_call_hook: RwLock<Option<SyncCallHook>>,
    destroyed_callbacks: Mutex<Vec<DestroyedCallback>>,
}

impl QueueCore {
    pub(crate) fn id(&self) -> QueueId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn is_quitting(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn is_processing_messages(&self) -> bool {
        !self.is_quitting()
    }

    fn current_multiplexer(&self) -> Arc<dyn Multiplexer> {
        self.multiplexer.read().clone()
    }

    fn wake_up(&self) {
        self.current_multiplexer().wake_up();
    }

    pub(crate) fn post(
        &self,
        posted_from: &'static Location<'static>,
        handler: Option<HandlerRef>,
        id: u32,
        data: Option<MessageData>,
        time_sensitive: bool,
    ) {
        if self.is_quitting() {
            trace!(queue = %self.name(), id, %posted_from, "post after quit dropped");
            return;
        }

        // Wake outside the lock
        {
            let mut msg = Message::new(posted_from, handler, id, data);
            if time_sensitive {
                msg.ts_sensitive = Some(self.clock.time_after(self.config.max_msg_latency()));
            }
            self.queues.lock().msgq.push_back(msg);
        }
        self.wake_up();
    }

    pub(crate) fn post_delayed(
        &self,
        posted_from: &'static Location<'static>,
        delay: Duration,
        trigger: Instant,
        handler: Option<HandlerRef>,
        id: u32,
        data: Option<MessageData>,
    ) {
        if self.is_quitting() {
            trace!(queue = %self.name(), id, %posted_from, "delayed post after quit dropped");
            return;
        }

        {
            let msg = Message::new(posted_from, handler, id, data);
            let mut queues = self.queues.lock();
            let seq = queues.dmsgq_next_num;
            queues.dmsgq_next_num += 1;
            queues
                .dmsgq
                .push(DelayedMessage::new(delay, trigger, seq, msg));
        }
        self.wake_up();
    }

    /// Remove matching messages. Dropped payloads are released after the
    /// lock so their destructors may touch this queue.
    pub(crate) fn clear(
        &self,
        handler: Option<HandlerId>,
        id: u32,
        removed: Option<&mut Vec<Message>>,
    ) {
        let doomed = self.queues.lock().extract(handler, id);
        if doomed.is_empty() {
            return;
        }
        trace!(queue = %self.name(), count = doomed.len(), "cleared messages");
        match removed {
            Some(out) => out.extend(doomed),
            None => drop(doomed),
        }
    }
}

/// Builder for [`MessageQueue`]
pub struct MessageQueueBuilder {
    config: MessageQueueConfig,
    clock: Option<Arc<dyn Clock>>,
    multiplexer: Option<Arc<dyn Multiplexer>>,
    manager: Option<Arc<MessageQueueManager>>,
    init_queue: bool,
}

impl MessageQueueBuilder {
    fn new() -> Self {
        Self {
            config: MessageQueueConfig::default(),
            clock: None,
            multiplexer: None,
            manager: None,
            init_queue: true,
        }
    }

    /// Use the given configuration
    pub fn config(mut self, config: MessageQueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the queue name used in log output
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Read time from `clock` instead of the system clock
    ///
    /// The clock decides when delayed messages become ready. Wait budgets
    /// passed to [`MessageQueue::get`] are always measured in real time, so
    /// with a [`FakeClock`](crate::FakeClock) a delayed message is only
    /// delivered once the clock has been advanced past its trigger.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Suspend in `multiplexer` instead of a private [`NullMultiplexer`]
    pub fn multiplexer(mut self, multiplexer: Arc<dyn Multiplexer>) -> Self {
        self.multiplexer = Some(multiplexer);
        self
    }

    /// Register with `manager` instead of the global one
    pub fn manager(mut self, manager: Arc<MessageQueueManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Whether to register with the manager immediately. Owners that finish
    /// their own setup first pass `false` and call
    /// [`MessageQueue::do_init`] later.
    pub fn init_queue(mut self, init: bool) -> Self {
        self.init_queue = init;
        self
    }

    pub fn build(self) -> MessageQueue {
        let default_multiplexer: Arc<dyn Multiplexer> = Arc::new(NullMultiplexer::new());
        let multiplexer = self
            .multiplexer
            .unwrap_or_else(|| default_multiplexer.clone());

        let core = Arc::new(QueueCore {
            id: QueueId::next(),
            config: self.config,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            queues: Mutex::new(Queues::default()),
            stop: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            multiplexer: RwLock::new(multiplexer.clone()),
            default_multiplexer,
            sync_call_hook: RwLock::new(None),
            destroyed_callbacks: Mutex::new(Vec::new()),
        });
        multiplexer.set_message_queue(Some(core.id));

        let queue = MessageQueue {
            core,
            manager: self.manager.unwrap_or_else(MessageQueueManager::global),
        };
        if self.init_queue {
            queue.do_init();
        }
        queue
    }
}

/// A thread's event loop: an immediate FIFO plus a delayed min-heap
///
/// Posting is safe from any thread. `get`, `peek` and `dispatch` belong to the
/// single consumer that owns the queue. Dropping the queue unregisters it,
/// fires its destroyed callbacks, and drops every pending payload.
pub struct MessageQueue {
    core: Arc<QueueCore>,
    manager: Arc<MessageQueueManager>,
}

impl MessageQueue {
    /// Create and register a queue with default settings
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MessageQueueBuilder {
        MessageQueueBuilder::new()
    }

    pub(crate) fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }

    pub fn id(&self) -> QueueId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn config(&self) -> &MessageQueueConfig {
        &self.core.config
    }

    /// The manager this queue registers with
    pub fn manager(&self) -> &Arc<MessageQueueManager> {
        &self.manager
    }

    /// Register with the manager. Idempotent.
    pub fn do_init(&self) {
        if self.core.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.add(self);
        debug!(queue = %self.name(), id = %self.id(), "message queue initialized");
    }

    pub fn state(&self) -> QueueState {
        if !self.core.initialized.load(Ordering::SeqCst) {
            QueueState::Created
        } else if self.core.is_quitting() {
            QueueState::Quitting
        } else {
            QueueState::Active
        }
    }

    /// Post a message for immediate dispatch
    ///
    /// A time-sensitive message that is not delivered within the configured
    /// maximum latency produces a warning when it is finally dequeued. Posts
    /// made after [`quit`](Self::quit) are dropped along with their payload.
    #[track_caller]
    pub fn post(
        &self,
        handler: Option<HandlerRef>,
        id: u32,
        data: Option<MessageData>,
        time_sensitive: bool,
    ) {
        self.core
            .post(Location::caller(), handler, id, data, time_sensitive);
    }

    /// Post a message to be dispatched after `delay`
    #[track_caller]
    pub fn post_delayed(
        &self,
        delay: Duration,
        handler: Option<HandlerRef>,
        id: u32,
        data: Option<MessageData>,
    ) {
        let trigger = self.core.clock.time_after(delay);
        self.core
            .post_delayed(Location::caller(), delay, trigger, handler, id, data);
    }

    /// Post a message to be dispatched at `trigger`
    ///
    /// Messages with identical trigger times are delivered in call order.
    #[track_caller]
    pub fn post_at(
        &self,
        trigger: Instant,
        handler: Option<HandlerRef>,
        id: u32,
        data: Option<MessageData>,
    ) {
        let delay = self.core.clock.time_until(trigger);
        self.core
            .post_delayed(Location::caller(), delay, trigger, handler, id, data);
    }

    /// Hand `data` to the consumer thread to be dropped there
    #[track_caller]
    pub fn dispose(&self, data: MessageData) {
        self.core
            .post(Location::caller(), None, 0, Some(data), false);
    }

    /// Wait up to `wait` (`None` = forever) for the next ready message
    ///
    /// Returns `None` when the wait budget runs out, when the queue is quitting
    /// and nothing is ready, or when the multiplexer aborts the wait. Dispose
    /// sentinels are consumed here and never returned.
    pub fn get(&self, wait: Option<Duration>, process_io: bool) -> Option<Message> {
        let core = &*self.core;

        if let Some(msg) = core.queues.lock().peeked.take() {
            return Some(msg);
        }

        // The caller's budget is real time; trigger times follow the clock
        let start = Instant::now();
        let mut now = core.clock.now();

        loop {
            self.receive_sends();

            let mut delay_next: Option<Duration> = None;
            let mut first_pass = true;

            loop {
                let mut msg = {
                    let mut guard = core.queues.lock();
                    let queues = &mut *guard;

                    // Promote elapsed delayed messages once per wake
                    if first_pass {
                        first_pass = false;
                        while let Some(top) = queues.dmsgq.peek() {
                            if now < top.trigger {
                                delay_next = Some(time_diff(top.trigger, now));
                                break;
                            }
                            if let Some(ready) = queues.dmsgq.pop() {
                                queues.msgq.push_back(ready.msg);
                            }
                        }
                    }

                    match queues.msgq.pop_front() {
                        Some(msg) => msg,
                        None => break,
                    }
                };

                if let Some(deadline) = msg.ts_sensitive {
                    let delivered = core.clock.now();
                    if delivered > deadline {
                        let late = time_diff(delivered, deadline) + core.config.max_msg_latency();
                        warn!(
                            queue = %core.name(),
                            id = msg.message_id,
                            posted_from = %msg.posted_from,
                            "time-sensitive message delayed {}ms",
                            late.as_millis()
                        );
                    }
                }

                if msg.is_dispose() {
                    drop(msg.data.take());
                    continue;
                }

                return Some(msg);
            }

            if core.is_quitting() {
                break;
            }

            let wait_next = match wait {
                None => delay_next,
                Some(budget) => {
                    let remaining = budget.saturating_sub(start.elapsed());
                    Some(delay_next.map_or(remaining, |d| d.min(remaining)))
                }
            };

            if !core.current_multiplexer().wait(wait_next, process_io) {
                debug!(queue = %core.name(), "multiplexer aborted wait");
                return None;
            }

            now = core.clock.now();
            if let Some(budget) = wait {
                if start.elapsed() >= budget {
                    return None;
                }
            }
        }

        None
    }

    /// Look at the next message without consuming it
    ///
    /// Returns a snapshot of the envelope; the message itself stays cached in
    /// the queue and the next `get` returns exactly it. No lock is held once
    /// this returns.
    pub fn peek(&self, wait: Option<Duration>) -> Option<MessageInfo> {
        if let Some(info) = self.core.queues.lock().peeked.as_ref().map(Message::info) {
            return Some(info);
        }

        let msg = self.get(wait, true)?;
        let info = msg.info();
        self.core.queues.lock().peeked = Some(msg);
        Some(info)
    }

    /// Run the message's handler on this thread
    ///
    /// No queue lock is held. Dispatches at or above the slow-dispatch
    /// threshold are logged with the message origin.
    pub fn dispatch(&self, mut msg: Message) {
        let core = &*self.core;
        let Some(handler) = msg.handler.as_ref().and_then(HandlerRef::upgrade) else {
            debug!(
                queue = %core.name(),
                id = msg.message_id,
                posted_from = %msg.posted_from,
                "handler gone, dropping message"
            );
            return;
        };

        let start = core.clock.now();
        handler.on_message(&mut msg);
        let elapsed = core.clock.time_since(start);

        if elapsed >= core.config.slow_dispatch_threshold() {
            info!(
                queue = %core.name(),
                id = msg.message_id,
                "Message took {}ms to dispatch. Posted from: {}",
                elapsed.as_millis(),
                msg.posted_from
            );
        }
    }

    /// Remove pending messages for `handler` (`None` = any) with `id`
    /// ([`MQID_ANY`](crate::MQID_ANY) = any)
    ///
    /// Matched messages, including a peeked one, are moved into `removed` when
    /// given, otherwise their payloads are dropped.
    pub fn clear(&self, handler: Option<HandlerId>, id: u32, removed: Option<&mut Vec<Message>>) {
        self.core.clear(handler, id, removed);
    }

    /// Stop serving: posts are dropped and a blocked `get` returns once the
    /// ready messages are drained
    pub fn quit(&self) {
        self.core.stop.store(true, Ordering::SeqCst);
        self.core.wake_up();
        debug!(queue = %self.name(), "message queue quitting");
    }

    pub fn is_quitting(&self) -> bool {
        self.core.is_quitting()
    }

    /// Resume serving after [`quit`](Self::quit)
    pub fn restart(&self) {
        self.core.stop.store(false, Ordering::SeqCst);
    }

    /// Whether the queue accepts and delivers messages
    pub fn is_processing_messages(&self) -> bool {
        self.core.is_processing_messages()
    }

    /// How long an outer loop may wait before this queue has work
    ///
    /// Zero when a message is ready, the time to the earliest delayed message
    /// otherwise, and `None` when nothing is pending.
    pub fn get_delay(&self) -> Option<Duration> {
        let queues = self.core.queues.lock();
        if !queues.msgq.is_empty() {
            return Some(Duration::ZERO);
        }
        queues
            .dmsgq
            .peek()
            .map(|top| self.core.clock.time_until(top.trigger))
    }

    /// Number of pending messages, including a peeked one
    pub fn size(&self) -> usize {
        self.core.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn multiplexer(&self) -> Arc<dyn Multiplexer> {
        self.core.current_multiplexer()
    }

    /// Replace the multiplexer; `None` restores the built-in one
    pub fn set_multiplexer(&self, multiplexer: Option<Arc<dyn Multiplexer>>) {
        let multiplexer = multiplexer.unwrap_or_else(|| self.core.default_multiplexer.clone());
        multiplexer.set_message_queue(Some(self.id()));
        let previous = std::mem::replace(&mut *self.core.multiplexer.write(), multiplexer);
        // A consumer parked in the old multiplexer must re-read the new one
        previous.wake_up();
    }

    /// Install the hook that drains synchronous cross-thread calls
    pub fn set_sync_call_hook(&self, hook: Option<SyncCallHook>) {
        *self.core.sync_call_hook.write() = hook;
    }

    /// Register a callback fired once when the queue is destroyed
    pub fn on_destroyed<F>(&self, callback: F)
    where
        F: FnOnce(QueueId) + Send + 'static,
    {
        self.core.destroyed_callbacks.lock().push(Box::new(callback));
    }

    fn receive_sends(&self) {
        let hook = self.core.sync_call_hook.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        let id = self.id();

        let callbacks = std::mem::take(&mut *self.core.destroyed_callbacks.lock());
        for callback in callbacks {
            callback(id);
        }

        if self.core.initialized.load(Ordering::SeqCst) {
            self.manager.remove(self);
        }

        let pending = self.core.queues.lock().extract(None, crate::message::MQID_ANY);
        if !pending.is_empty() {
            debug!(queue = %self.name(), count = pending.len(), "disposing pending messages");
        }
        drop(pending);

        self.core.current_multiplexer().set_message_queue(None);
        debug!(queue = %self.name(), %id, "message queue destroyed");
    }
}
