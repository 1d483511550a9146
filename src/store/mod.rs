//! Shared message store
//!
//! Holds a single copy of every published message, reference-counted by the
//! per-client delivery records that point at it. A message enters the store
//! when it is published (from a client, a bridge, the broker itself, or a
//! persistence restore) and leaves when the last delivery record referencing
//! it is released.
//!
//! The reference count here is the store's own bookkeeping, deliberately
//! distinct from `Arc::strong_count`: it counts delivery records plus
//! retained-store holders, and reaching zero triggers removal and the
//! persistence delete notification.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::persistence::{PersistenceOp, Persister};
use crate::protocol::{DeliveryError, MessageOrigin, Properties, QoS};

mod id;

pub use id::MessageIdGenerator;


/// The canonical copy of a published message.
///
/// Immutable message data plus two pieces of interior-mutable bookkeeping:
/// the store reference count and the set of client ids the message has
/// already been delivered to (duplicate suppression for overlapping
/// subscriptions).
#[derive(Debug)]
pub struct BaseMessage {
    /// Store-wide unique id, assigned by [`MessageIdGenerator`] unless restored
    pub id: u64,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub properties: Properties,
    pub qos: QoS,
    pub retain: bool,
    pub origin: MessageOrigin,
    /// Client id of the publisher, if any
    pub source_id: Option<Arc<str>>,
    pub source_username: Option<String>,
    /// Listener the publish arrived on
    pub source_listener: Option<String>,
    /// Wire packet id used by the publisher (distinct from delivery mids)
    pub source_mid: u16,
    /// Wall-clock seconds after which the message must not be delivered;
    /// 0 = never expires
    pub expiry_time: u64,
    /// Number of delivery records (plus retained-store holders) referencing
    /// this entry
    ref_count: AtomicU32,
    /// Client ids this message was already queued for
    dest_ids: Mutex<AHashSet<Arc<str>>>,
}

impl BaseMessage {
    pub fn new(
        id: u64,
        topic: impl Into<Arc<str>>,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        origin: MessageOrigin,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            payload,
            properties: Properties::default(),
            qos,
            retain,
            origin,
            source_id: None,
            source_username: None,
            source_listener: None,
            source_mid: 0,
            expiry_time: 0,
            ref_count: AtomicU32::new(0),
            dest_ids: Mutex::new(AHashSet::new()),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Set the absolute expiry instant (wall-clock seconds, 0 = never)
    pub fn with_expiry_time(mut self, expiry_time: u64) -> Self {
        self.expiry_time = expiry_time;
        self
    }

    pub fn with_source(
        mut self,
        source_id: Option<Arc<str>>,
        source_username: Option<String>,
        source_listener: Option<String>,
        source_mid: u16,
    ) -> Self {
        self.source_id = source_id;
        self.source_username = source_username;
        self.source_listener = source_listener;
        self.source_mid = source_mid;
        self
    }

    /// Current store reference count
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Whether the message is past its expiry instant
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry_time != 0 && self.expiry_time < now
    }

    /// Record that this message was queued for `client_id`.
    /// Returns false if the client was already recorded.
    pub fn mark_delivered(&self, client_id: &Arc<str>) -> bool {
        self.dest_ids.lock().insert(client_id.clone())
    }

    /// Whether this message was already queued for `client_id`
    pub fn was_delivered_to(&self, client_id: &str) -> bool {
        self.dest_ids.lock().contains(client_id)
    }
}

/// Process-wide store of published messages, indexed by message id.
pub struct MessageStore {
    messages: DashMap<u64, Arc<BaseMessage>>,
    bytes: AtomicUsize,
    persister: Option<Arc<dyn Persister>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            bytes: AtomicUsize::new(0),
            persister: None,
        }
    }

    /// Create a store whose removals notify the given persister
    pub fn with_persister(persister: Arc<dyn Persister>) -> Self {
        Self {
            messages: DashMap::new(),
            bytes: AtomicUsize::new(0),
            persister: Some(persister),
        }
    }

    /// Insert a message. Fails with `AlreadyExists` if the id is taken.
    pub fn add(&self, message: Arc<BaseMessage>) -> Result<(), DeliveryError> {
        use dashmap::mapref::entry::Entry;

        match self.messages.entry(message.id) {
            Entry::Occupied(_) => Err(DeliveryError::AlreadyExists),
            Entry::Vacant(slot) => {
                self.bytes
                    .fetch_add(message.payload.len(), Ordering::Relaxed);
                slot.insert(message);
                Ok(())
            }
        }
    }

    /// Look up a message by id
    pub fn get(&self, id: u64) -> Option<Arc<BaseMessage>> {
        self.messages.get(&id).map(|entry| entry.clone())
    }

    /// Detach a message from the index.
    ///
    /// When `notify` is set, the persistence delete hook fires; teardown
    /// paths pass false.
    pub fn remove(&self, message: &BaseMessage, notify: bool) {
        if self.messages.remove(&message.id).is_some() {
            self.bytes
                .fetch_sub(message.payload.len(), Ordering::Relaxed);
            if notify {
                if let Some(persister) = &self.persister {
                    persister.persist(PersistenceOp::BaseMessageDelete { db_id: message.id });
                }
            }
        }
    }

    /// Take a delivery reference on a message
    pub fn ref_inc(&self, message: &Arc<BaseMessage>) {
        message.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Release a delivery reference, consuming the caller's handle.
    ///
    /// Removes the message from the store (with persistence notification)
    /// when the last reference is released.
    pub fn ref_dec(&self, message: Arc<BaseMessage>) {
        let previous = message.ref_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "ref_dec on unreferenced message");
        if previous == 1 {
            self.remove(&message, true);
        }
    }

    /// Sweep entries nothing references.
    ///
    /// Restore can leave stored messages whose delivery records did not
    /// survive; this repairs the refcount invariant. Returns the number of
    /// entries removed.
    pub fn compact(&self) -> usize {
        let orphaned: Vec<Arc<BaseMessage>> = self
            .messages
            .iter()
            .filter(|entry| entry.ref_count() == 0)
            .map(|entry| entry.clone())
            .collect();

        for message in &orphaned {
            debug!(id = message.id, topic = %message.topic, "removing unreferenced stored message");
            self.remove(message, true);
        }
        orphaned.len()
    }

    /// Unconditional teardown at shutdown. No notifications fire.
    pub fn clean(&self) {
        self.messages.clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    /// Number of stored messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total payload bytes held by the store
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Build, store, and fan out a message in one call.
    ///
    /// The convenience path for broker-originated publishes ($SYS topics,
    /// will messages) and simple client publishes: assigns an id, computes
    /// the expiry instant, inserts into the store, and hands the message to
    /// the subscription matcher, which queues it for every receiver. If
    /// nothing ends up referencing the message it is released again.
    pub fn easy_queue(
        &self,
        ids: &MessageIdGenerator,
        matcher: &mut dyn Matcher,
        request: PublishRequest,
        now: u64,
    ) -> Result<(), DeliveryError> {
        let expiry_time = if request.expiry_interval > 0 {
            now + u64::from(request.expiry_interval)
        } else {
            0
        };

        let origin = if request.source_id.is_some() {
            MessageOrigin::Client
        } else {
            MessageOrigin::Broker
        };

        let base = Arc::new(
            BaseMessage::new(
                ids.next(),
                request.topic,
                request.payload,
                request.qos,
                request.retain,
                origin,
            )
            .with_properties(request.properties)
            .with_expiry_time(expiry_time)
            .with_source(request.source_id, None, None, 0),
        );

        self.add(base.clone())?;

        let result = matcher.queue_message(
            base.source_id.as_deref(),
            &base.topic,
            base.qos,
            base.retain,
            &base,
        );

        // Nothing subscribed (or every receiver dropped it): nothing holds
        // a reference, so release the stored copy.
        if base.ref_count() == 0 {
            self.remove(&base, false);
        }
        result
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters for [`MessageStore::easy_queue`]
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Publisher client id; `None` marks a broker-originated message
    pub source_id: Option<Arc<str>>,
    pub topic: Arc<str>,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
    /// Message expiry interval in seconds, 0 = never expires
    pub expiry_interval: u32,
    pub properties: Properties,
}

/// Subscription matcher seam.
///
/// The matcher owns the subscription tree and the receiver sessions; for
/// every subscriber whose filter matches it queues an outgoing delivery of
/// `base`. Returns `NoSubscribers` when nothing matched.
pub trait Matcher {
    fn queue_message(
        &mut self,
        source_id: Option<&str>,
        topic: &str,
        qos: QoS,
        retain: bool,
        base: &Arc<BaseMessage>,
    ) -> Result<(), DeliveryError>;
}
