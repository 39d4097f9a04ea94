//! Short-lived duplicate suppression for inbound remote events.
//!
//! Each remote chat gets its own [`Deduplicator`] holding two bounded FIFO
//! windows: fingerprints of bridged messages mapped to the local identity they
//! were bridged as, and presence-only fingerprints of service actions. Nothing
//! here is persisted; a restart starts from empty windows.

use relaybridge_models::event::{MediaRef, RemoteEvent, RemoteEventBody};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 20;

/// Dedup key of a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// Native remote id, trusted in chats where ids are unique per event.
    Id(i64),
    /// Content digest for chats where the same event arrives under
    /// different ids.
    Hash([u8; 32]),
}

impl Fingerprint {
    pub fn of(event: &RemoteEvent, force_hash: bool) -> Self {
        if force_hash {
            Self::Hash(content_digest(event))
        } else {
            Self::Id(event.id)
        }
    }
}

fn content_digest(event: &RemoteEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    // Remote timestamps only have second resolution.
    hasher.update(event.date.timestamp().to_be_bytes());
    match &event.body {
        RemoteEventBody::Message {
            text,
            forwarded_from,
            media,
        } => {
            hasher.update(b"msg\x1f");
            hasher.update(text.trim().as_bytes());
            hasher.update(b"\x1f");
            // A forward is identified by its origin; its media is not hashed.
            match (forwarded_from, media) {
                (Some(origin), _) => {
                    hasher.update(b"fwd:");
                    hasher.update(origin.to_be_bytes());
                }
                (None, Some(MediaRef::Document { id })) => {
                    hasher.update(b"doc:");
                    hasher.update(id.to_be_bytes());
                }
                (None, Some(MediaRef::Photo { id })) => {
                    hasher.update(b"photo:");
                    hasher.update(id.unwrap_or(0).to_be_bytes());
                }
                (None, Some(MediaRef::Geo { lat, long })) => {
                    hasher.update(b"geo:");
                    hasher.update(lat.to_bits().to_be_bytes());
                    hasher.update(long.to_bits().to_be_bytes());
                }
                (None, Some(MediaRef::Contact { user_id })) => {
                    hasher.update(b"contact:");
                    hasher.update(user_id.to_be_bytes());
                }
                (None, Some(MediaRef::Other)) | (None, None) => {}
            }
        }
        RemoteEventBody::Service { action } => {
            hasher.update(b"svc\x1f");
            if let Some(sender) = event.sender_id {
                hasher.update(sender.to_be_bytes());
            }
            hasher.update(b"\x1f");
            hasher.update(action.as_bytes());
        }
    }
    hasher.finalize().into()
}

/// Local identity a remote event was (or is being) bridged as, and the chat
/// space it was first seen through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalRef {
    /// `None` while translation is still in flight.
    pub event_id: Option<String>,
    pub room_id: String,
    pub space: i64,
}

impl LocalRef {
    pub fn pending(room_id: impl Into<String>, space: i64) -> Self {
        Self {
            event_id: None,
            room_id: room_id.into(),
            space,
        }
    }

    pub fn new(event_id: impl Into<String>, room_id: impl Into<String>, space: i64) -> Self {
        Self {
            event_id: Some(event_id.into()),
            room_id: room_id.into(),
            space,
        }
    }
}

/// Outcome of [`Deduplicator::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile<V> {
    /// The stored value matched the expectation and was overwritten.
    Replaced,
    /// Another writer already stored this value; nothing was written.
    Conflict(V),
    /// The fingerprint is not in the window (never seen or already evicted).
    Missing,
}

struct Window<V> {
    capacity: usize,
    order: VecDeque<Fingerprint>,
    values: HashMap<Fingerprint, V>,
}

impl<V> Window<V> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity + 1),
            values: HashMap::with_capacity(capacity + 1),
        }
    }

    fn push(&mut self, key: Fingerprint, value: V) {
        self.order.push_back(key);
        self.values.insert(key, value);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.values.remove(&oldest);
            }
        }
    }
}

struct Windows<V> {
    messages: Window<V>,
    actions: Window<()>,
}

pub struct Deduplicator<V> {
    inner: Mutex<Windows<V>>,
}

impl<V: Clone + PartialEq> Deduplicator<V> {
    pub fn new(capacity: usize, action_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Windows {
                messages: Window::new(capacity),
                actions: Window::new(action_capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows<V>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert-if-absent. Returns `None` when the event is new and `pending`
    /// was stored, otherwise the value stored by whoever saw it first.
    pub fn check(&self, event: &RemoteEvent, pending: V, force_hash: bool) -> Option<V> {
        let key = Fingerprint::of(event, force_hash);
        let mut windows = self.lock();
        if let Some(existing) = windows.messages.values.get(&key) {
            return Some(existing.clone());
        }
        windows.messages.push(key, pending);
        None
    }

    /// Presence-only check for service events. Always keyed by content, since
    /// service notifications carry nothing stable beyond what they say.
    /// Returns `true` if the action was already seen.
    pub fn check_action(&self, event: &RemoteEvent) -> bool {
        let key = Fingerprint::of(event, true);
        let mut windows = self.lock();
        if windows.actions.values.contains_key(&key) {
            return true;
        }
        windows.actions.push(key, ());
        false
    }

    /// Replace the stored value with `new_value` only if it still equals
    /// `expected`. The entry keeps its place in the eviction order.
    pub fn reconcile(
        &self,
        event: &RemoteEvent,
        new_value: V,
        expected: &V,
        force_hash: bool,
    ) -> Reconcile<V> {
        let key = Fingerprint::of(event, force_hash);
        let mut windows = self.lock();
        match windows.messages.values.get_mut(&key) {
            None => Reconcile::Missing,
            Some(current) if current != expected => Reconcile::Conflict(current.clone()),
            Some(current) => {
                *current = new_value;
                Reconcile::Replaced
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().messages.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remote chat key: `(chat_id, space)`. Dedup windows are shared by every
/// space of a chat; the space only travels in the stored [`LocalRef`].
pub type ChatKey = (i64, i64);

/// Hands out one deduplicator per remote chat id. Chats idle for longer than
/// the configured TTL are dropped together with their windows.
#[derive(Clone)]
pub struct DedupRegistry {
    chats: moka::future::Cache<i64, Arc<Deduplicator<LocalRef>>>,
    capacity: usize,
    action_capacity: usize,
}

impl DedupRegistry {
    pub fn new(capacity: usize, action_capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            chats: moka::future::Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(idle_ttl)
                .build(),
            capacity,
            action_capacity,
        }
    }

    pub async fn for_chat(&self, chat_id: i64) -> Arc<Deduplicator<LocalRef>> {
        let (capacity, action_capacity) = (self.capacity, self.action_capacity);
        self.chats
            .get_with(chat_id, async move {
                tracing::debug!(chat_id, "dedup: new chat window");
                Arc::new(Deduplicator::new(capacity, action_capacity))
            })
            .await
    }

    /// Drop a chat's windows, e.g. when the chat mapping is torn down.
    pub async fn forget(&self, chat_id: i64) {
        self.chats.invalidate(&chat_id).await;
    }
}
