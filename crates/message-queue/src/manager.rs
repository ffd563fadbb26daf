//! Process-wide registry of live message queues
//!
//! Every initialized [`MessageQueue`] registers with a
//! [`MessageQueueManager`], by default the one returned by
//! [`MessageQueueManager::global`]. The manager keeps only weak references,
//! keyed by [`QueueId`], and uses them for two things:
//!
//! - [`clear`](MessageQueueManager::clear) purges a dying handler from every
//!   queue;
//! - [`process_all_message_queues`](MessageQueueManager::process_all_message_queues)
//!   is a barrier that returns once every queue has dispatched everything that
//!   was posted to it before the call.
//!
//! # Lifecycle
//!
//! The registry itself is created by the first `add` and torn down when the
//! last queue is removed, so nothing outlives the queues at shutdown. Creating
//! and tearing down the registry is only race-free once worker threads have
//! stopped registering queues; this is a documented precondition, not checked
//! at runtime.
//!
//! Registry calls must not be made from code running under the registry lock
//! (for example from a payload destructor run by the barrier's posts). Debug
//! builds assert on such re-entry; release builds deadlock.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::handler::HandlerId;
use crate::message::MQID_ANY;
use crate::queue::{MessageQueue, QueueCore, QueueId};

static GLOBAL_MANAGER: Lazy<Arc<MessageQueueManager>> =
    Lazy::new(|| Arc::new(MessageQueueManager::new()));

thread_local! {
    /// Managers whose registry lock this thread currently holds
    static HELD_REGISTRIES: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

#[derive(Default)]
struct Registry {
    queues: BTreeMap<QueueId, Weak<QueueCore>>,
}

impl Registry {
    fn live(&self) -> impl Iterator<Item = Arc<QueueCore>> + '_ {
        self.queues.values().filter_map(Weak::upgrade)
    }
}

/// Registry lock guard that tracks re-entry on the current thread
struct RegistryGuard<'a> {
    guard: MutexGuard<'a, Option<Registry>>,
    owner: usize,
}

impl Deref for RegistryGuard<'_> {
    type Target = Option<Registry>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for RegistryGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        HELD_REGISTRIES.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&owner| owner == self.owner) {
                held.remove(pos);
            }
        });
    }
}

/// Payload of a barrier message; releases its count when dropped, whether the
/// message was consumed, cleared, or disposed with its queue
struct BarrierToken {
    pending: Arc<AtomicUsize>,
}

impl BarrierToken {
    fn new(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        Self {
            pending: pending.clone(),
        }
    }
}

impl Drop for BarrierToken {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of live message queues
pub struct MessageQueueManager {
    registry: Mutex<Option<Registry>>,
}

impl MessageQueueManager {
    /// Create an independent manager
    ///
    /// Most code uses [`global`](Self::global); separate managers are useful
    /// for embedding several engines in one process and for tests.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(None),
        }
    }

    /// The process-wide manager
    pub fn global() -> Arc<MessageQueueManager> {
        GLOBAL_MANAGER.clone()
    }

    fn lock_registry(&self) -> RegistryGuard<'_> {
        let owner = self as *const Self as usize;
        HELD_REGISTRIES.with(|held| {
            let mut held = held.borrow_mut();
            debug_assert!(
                !held.contains(&owner),
                "re-entrant MessageQueueManager registry access"
            );
            held.push(owner);
        });
        RegistryGuard {
            guard: self.registry.lock(),
            owner,
        }
    }

    /// Register a queue, creating the registry if this is the first one
    pub fn add(&self, queue: &MessageQueue) {
        let core = queue.core();
        let mut registry = self.lock_registry();
        let registry = registry.get_or_insert_with(|| {
            debug!("message queue registry created");
            Registry::default()
        });
        registry.queues.insert(core.id(), Arc::downgrade(core));
        trace!(queue = %core.name(), id = %core.id(), "queue registered");
    }

    /// Unregister a queue, tearing the registry down once it is empty
    pub fn remove(&self, queue: &MessageQueue) {
        let id = queue.id();
        let mut registry = self.lock_registry();
        let Some(inner) = registry.as_mut() else {
            return;
        };
        inner.queues.remove(&id);
        trace!(%id, "queue unregistered");
        if inner.queues.is_empty() {
            *registry = None;
            debug!("message queue registry torn down");
        }
    }

    /// Whether the registry currently exists
    pub fn is_initialized(&self) -> bool {
        self.lock_registry().is_some()
    }

    /// Number of registered queues
    pub fn queue_count(&self) -> usize {
        self.lock_registry()
            .as_ref()
            .map_or(0, |registry| registry.queues.len())
    }

    /// Remove every message for `handler` from every registered queue
    ///
    /// Called when a handler goes away so no queue keeps a reference to it.
    /// Payloads are dropped after the registry lock is released.
    pub fn clear(&self, handler: HandlerId) {
        let queues: Vec<Arc<QueueCore>> = match self.lock_registry().as_ref() {
            Some(registry) => registry.live().collect(),
            None => return,
        };
        for queue in queues {
            queue.clear(Some(handler), MQID_ANY, None);
        }
    }

    /// Block until every registered queue has processed all messages posted
    /// to it before this call
    ///
    /// A zero-delay barrier message goes to each queue that is processing
    /// messages. If the calling thread owns one of the registered queues it
    /// must pass it as `current`: that queue is pumped with zero-timeout
    /// `get`/`dispatch` while waiting, otherwise the wait could never finish.
    /// Queues without a running consumer are waited on forever.
    #[track_caller]
    pub fn process_all_message_queues(&self, current: Option<&MessageQueue>) {
        let posted_from = Location::caller();
        let pending = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        {
            let registry = self.lock_registry();
            if let Some(registry) = registry.as_ref() {
                for queue in registry.live() {
                    if !queue.is_processing_messages() {
                        continue;
                    }
                    let token = BarrierToken::new(&pending);
                    queue.post_delayed(
                        posted_from,
                        Duration::ZERO,
                        queue.now(),
                        None,
                        0,
                        Some(Box::new(token)),
                    );
                }
            }
        }

        trace!(pending = pending.load(Ordering::Acquire), "barrier posted");
        while pending.load(Ordering::Acquire) > 0 {
            match current {
                Some(queue) => {
                    while let Some(msg) = queue.get(Some(Duration::ZERO), true) {
                        queue.dispatch(msg);
                    }
                }
                None => std::thread::yield_now(),
            }
        }
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "all message queues processed");
    }
}

impl Default for MessageQueueManager {
    fn default() -> Self {
        Self::new()
    }
}
