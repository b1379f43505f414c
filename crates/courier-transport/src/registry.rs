//! Topic → subscription, at most one per topic.
//!
//! The registry keeps its own handle on the current connection's outbound
//! queue. While there is none (or the queue is full) entries wait as
//! `Pending`; [`SubscriptionRegistry::resume`] and
//! [`SubscriptionRegistry::flush_pending`] put them on the wire.

use std::collections::BTreeMap;
use std::fmt;

use courier_core::{SubscriptionId, Topic};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol;

/// Handle for a topic's single subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Wire-level subscription id.
    pub id: SubscriptionId,
    /// Topic key.
    pub topic: Topic,
    /// Broker destination the topic maps to.
    pub destination: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Pending,
    Live,
}

struct Entry {
    handle: SubscriptionHandle,
    state: EntryState,
}

#[derive(Default)]
struct Inner {
    // ordered so replays are deterministic
    entries: BTreeMap<Topic, Entry>,
    link: Option<mpsc::Sender<String>>,
}

impl Inner {
    /// Queue `SUBSCRIBE` for `entry` on the current link.
    fn try_subscribe(link: Option<&mpsc::Sender<String>>, entry: &mut Entry) -> bool {
        let Some(link) = link else {
            entry.state = EntryState::Pending;
            return false;
        };
        let frame = protocol::subscribe_frame(&entry.handle.id, &entry.handle.destination);
        if link.try_send(frame.encode()).is_ok() {
            entry.state = EntryState::Live;
            true
        } else {
            entry.state = EntryState::Pending;
            false
        }
    }
}

/// Idempotent topic subscriptions for the shared connection.
pub struct SubscriptionRegistry {
    topic_prefix: String,
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    /// Empty registry; destinations are `{topic_prefix}/{topic}`.
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The subscription for `topic`, created if this is the first interest.
    ///
    /// A new entry is subscribed on the wire immediately when a connection
    /// is up, otherwise it is deferred until [`resume`](Self::resume).
    pub fn ensure_subscribed(&self, topic: &Topic) -> SubscriptionHandle {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get(topic) {
            return existing.handle.clone();
        }

        let mut entry = Entry {
            handle: SubscriptionHandle {
                id: SubscriptionId::new(),
                topic: topic.clone(),
                destination: topic.destination(&self.topic_prefix),
            },
            state: EntryState::Pending,
        };
        let sent = Inner::try_subscribe(inner.link.as_ref(), &mut entry);
        let handle = entry.handle.clone();
        let _ = inner.entries.insert(topic.clone(), entry);
        drop(inner);

        if sent {
            debug!(%topic, subscription_id = %handle.id, "subscribed");
        } else {
            debug!(%topic, subscription_id = %handle.id, "subscription deferred");
        }
        handle
    }

    /// Attach a fresh connection and subscribe every recorded topic on it,
    /// once each. Returns how many went out.
    pub fn resume(&self, link: mpsc::Sender<String>) -> usize {
        let mut inner = self.inner.lock();
        let Inner { entries, link: slot } = &mut *inner;
        *slot = Some(link);
        let mut sent = 0;
        for entry in entries.values_mut() {
            if Inner::try_subscribe(slot.as_ref(), entry) {
                sent += 1;
            }
        }
        let total = entries.len();
        drop(inner);

        info!(replayed = sent, total, "subscriptions replayed");
        sent
    }

    /// Forget the connection; every entry becomes pending.
    pub fn suspend(&self) {
        let mut inner = self.inner.lock();
        inner.link = None;
        for entry in inner.entries.values_mut() {
            entry.state = EntryState::Pending;
        }
    }

    /// Retry entries whose `SUBSCRIBE` could not be queued. Returns how many
    /// went out.
    pub fn flush_pending(&self) -> usize {
        let mut inner = self.inner.lock();
        let Inner { entries, link } = &mut *inner;
        if link.is_none() {
            return 0;
        }
        let mut sent = 0;
        for entry in entries.values_mut() {
            if entry.state == EntryState::Pending && Inner::try_subscribe(link.as_ref(), entry) {
                sent += 1;
            }
        }
        if sent > 0 {
            debug!(sent, "pending subscriptions flushed");
        }
        sent
    }

    /// Drop every subscription and the connection handle.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.link = None;
    }

    /// Number of topics.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no topic is recorded.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether `topic` has a subscription.
    pub fn contains(&self, topic: &Topic) -> bool {
        self.inner.lock().entries.contains_key(topic)
    }

    /// Recorded topics, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Handle for `topic`, if subscribed.
    pub fn handle(&self, topic: &Topic) -> Option<SubscriptionHandle> {
        self.inner
            .lock()
            .entries
            .get(topic)
            .map(|e| e.handle.clone())
    }

    /// Entries not yet on the wire.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .count()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &inner.entries.len())
            .field("linked", &inner.link.is_some())
            .finish()
    }
}
