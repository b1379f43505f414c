//! Consumer → callbacks, independent of topics.
//!
//! Every registered message handler sees every inbound envelope. Handlers
//! that only care about one conversation filter inside the callback.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use courier_core::{ConsumerId, CourierError, MessageEnvelope};
use parking_lot::{ReentrantMutex, RwLock};
use tracing::debug;

use crate::dispatcher::call_isolated;

/// Invoked for every inbound envelope.
pub type MessageHandler = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Invoked for every connection-level failure.
pub type ErrorHandler = Arc<dyn Fn(&CourierError) + Send + Sync>;

/// Invoked each time the connection reaches `Connected`.
pub type ConnectedHandler = Arc<dyn Fn() + Send + Sync>;

/// Registration order of a message handler, unique for the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Sequence number.
    pub fn get(self) -> u64 {
        self.0
    }
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

fn next_handler_id() -> HandlerId {
    HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Callback bundle supplied on attach.
///
/// ```ignore
/// let callbacks = ConsumerCallbacks::new()
///     .on_message(|env| println!("{}: {}", env.sender_id, env.content))
///     .on_error(|err| eprintln!("transport: {err}"));
/// ```
#[derive(Clone, Default)]
pub struct ConsumerCallbacks {
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_connected: Option<ConnectedHandler>,
}

impl ConsumerCallbacks {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler for inbound envelopes.
    #[must_use]
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Handler for connection errors.
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&CourierError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Handler for (re)connection.
    #[must_use]
    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(f));
        self
    }

    /// Whether a message handler is set.
    pub fn has_message_handler(&self) -> bool {
        self.on_message.is_some()
    }
}

impl fmt::Debug for ConsumerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerCallbacks")
            .field("on_message", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_connected", &self.on_connected.is_some())
            .finish()
    }
}

/// A registered message handler together with its liveness flag.
///
/// The gate is held for the whole of every call. Retiring a slot clears the
/// flag, and [`Retired::wait`] then takes the gate once, so when it returns
/// the handler is neither running nor able to start again. The gate is
/// reentrant: a handler that detaches its own consumer does not wait on
/// itself.
pub struct HandlerSlot {
    id: HandlerId,
    consumer: ConsumerId,
    handler: MessageHandler,
    live: AtomicBool,
    gate: ReentrantMutex<()>,
}

impl HandlerSlot {
    fn new(id: HandlerId, consumer: &ConsumerId, handler: MessageHandler) -> Arc<Self> {
        Arc::new(Self {
            id,
            consumer: consumer.clone(),
            handler,
            live: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
        })
    }

    /// Registration id.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Consumer that owns the handler.
    pub fn consumer(&self) -> &ConsumerId {
        &self.consumer
    }

    /// Whether the handler may still be called.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Call the handler with panics caught.
    ///
    /// `None` if the slot was retired before the call could start.
    pub fn invoke(&self, envelope: &MessageEnvelope) -> Option<std::result::Result<(), String>> {
        let _running = self.gate.lock();
        if !self.is_live() {
            return None;
        }
        Some(call_isolated("on_message", || (self.handler)(envelope)))
    }

    fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn wait_idle(&self) {
        drop(self.gate.lock());
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("id", &self.id)
            .field("consumer", &self.consumer)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// Handlers removed from the directory, already marked as retired.
#[must_use = "call `wait` once no lock is held"]
#[derive(Debug, Default)]
pub struct Retired {
    slots: Vec<Arc<HandlerSlot>>,
}

impl Retired {
    /// Number of retired handlers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing was retired.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Block until no retired handler is mid-call on another thread.
    ///
    /// Must not be called while holding a lock a handler might take.
    pub fn wait(self) {
        for slot in &self.slots {
            slot.wait_idle();
        }
    }
}

#[derive(Default)]
struct ConsumerEntry {
    handlers: BTreeMap<HandlerId, Arc<HandlerSlot>>,
    on_error: Option<ErrorHandler>,
    on_connected: Option<ConnectedHandler>,
}

/// Registry of consumer callbacks.
#[derive(Default)]
pub struct HandlerDirectory {
    consumers: RwLock<HashMap<ConsumerId, ConsumerEntry>>,
}

impl HandlerDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message handler for `consumer`.
    pub fn register(&self, consumer: &ConsumerId, handler: MessageHandler) -> HandlerId {
        let id = next_handler_id();
        let _ = self
            .consumers
            .write()
            .entry(consumer.clone())
            .or_default()
            .handlers
            .insert(id, HandlerSlot::new(id, consumer, handler));
        debug!(consumer_id = %consumer, handler_id = id.get(), "handler registered");
        id
    }

    /// Remove one handler. The consumer entry goes with its last handler.
    ///
    /// Once this returns the handler is not running on another thread and
    /// will not be called again.
    pub fn unregister(&self, consumer: &ConsumerId, id: HandlerId) -> bool {
        let mut consumers = self.consumers.write();
        let Some(entry) = consumers.get_mut(consumer) else {
            return false;
        };
        let removed = entry.handlers.remove(&id);
        if entry.handlers.is_empty() {
            let _ = consumers.remove(consumer);
        }
        drop(consumers);

        match removed {
            Some(slot) => {
                slot.retire();
                slot.wait_idle();
                true
            }
            None => false,
        }
    }

    /// Install a whole callback bundle, replacing any error/connected
    /// callbacks `consumer` had. Returns the message handler's id if the
    /// bundle has one.
    pub fn register_consumer(
        &self,
        consumer: &ConsumerId,
        callbacks: ConsumerCallbacks,
    ) -> Option<HandlerId> {
        let ConsumerCallbacks {
            on_message,
            on_error,
            on_connected,
        } = callbacks;
        let id = on_message.as_ref().map(|_| next_handler_id());

        let mut consumers = self.consumers.write();
        let entry = consumers.entry(consumer.clone()).or_default();
        entry.on_error = on_error;
        entry.on_connected = on_connected;
        if let (Some(id), Some(handler)) = (id, on_message) {
            let _ = entry
                .handlers
                .insert(id, HandlerSlot::new(id, consumer, handler));
        }
        drop(consumers);

        debug!(consumer_id = %consumer, "consumer registered");
        id
    }

    /// Remove everything `consumer` registered.
    ///
    /// Its handlers are retired before the directory lock is released, so a
    /// fan-out pass already under way skips them. `None` if `consumer` had
    /// no entry.
    pub fn unregister_consumer(&self, consumer: &ConsumerId) -> Option<Retired> {
        let entry = self.consumers.write().remove(consumer)?;
        let slots: Vec<_> = entry.handlers.into_values().collect();
        for slot in &slots {
            slot.retire();
        }
        Some(Retired { slots })
    }

    /// Whether `consumer` has an entry.
    pub fn contains(&self, consumer: &ConsumerId) -> bool {
        self.consumers.read().contains_key(consumer)
    }

    /// Number of consumers with an entry.
    pub fn len(&self) -> usize {
        self.consumers.read().len()
    }

    /// Whether no consumer is registered.
    pub fn is_empty(&self) -> bool {
        self.consumers.read().is_empty()
    }

    /// Total message handlers across consumers.
    pub fn handler_count(&self) -> usize {
        self.consumers
            .read()
            .values()
            .map(|e| e.handlers.len())
            .sum()
    }

    /// Whether handler `id` of `consumer` is still registered.
    pub fn is_registered(&self, consumer: &ConsumerId, id: HandlerId) -> bool {
        self.consumers
            .read()
            .get(consumer)
            .is_some_and(|e| e.handlers.contains_key(&id))
    }

    /// Every message handler, in registration order.
    pub fn message_handlers(&self) -> Vec<Arc<HandlerSlot>> {
        let mut handlers: Vec<_> = self
            .consumers
            .read()
            .values()
            .flat_map(|e| e.handlers.values().cloned())
            .collect();
        handlers.sort_unstable_by_key(|slot| slot.id);
        handlers
    }

    /// Call every `on_error` callback. Returns how many panicked.
    pub fn notify_error(&self, error: &CourierError) -> usize {
        let callbacks: Vec<ErrorHandler> = self
            .consumers
            .read()
            .values()
            .filter_map(|e| e.on_error.clone())
            .collect();
        callbacks
            .iter()
            .filter(|cb| call_isolated("on_error", || cb(error)).is_err())
            .count()
    }

    /// Call every `on_connected` callback. Returns how many panicked.
    pub fn notify_connected(&self) -> usize {
        let callbacks: Vec<ConnectedHandler> = self
            .consumers
            .read()
            .values()
            .filter_map(|e| e.on_connected.clone())
            .collect();
        callbacks
            .iter()
            .filter(|cb| call_isolated("on_connected", || cb()).is_err())
            .count()
    }

    /// Drop every consumer, retiring all handlers.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.consumers.write());
        for slot in drained.into_values().flat_map(|e| e.handlers.into_values()) {
            slot.retire();
        }
    }
}

impl fmt::Debug for HandlerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDirectory")
            .field("consumers", &self.len())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
