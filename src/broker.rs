//! Broker-wide delivery context
//!
//! Bundles the pieces of delivery state that are shared by every session:
//! the message store and the id generator. The rest of the broker creates
//! one of these at startup, passes it wherever messages are stored or
//! published, and tears it down at shutdown.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::{info, warn};

use crate::config::Config;
use crate::persistence::{LoadedData, Persister, StoredClientMessage};
use crate::protocol::DeliveryError;
use crate::store::{BaseMessage, Matcher, MessageIdGenerator, MessageStore, PublishRequest};

/// A delivery record loaded from the backend, paired with its resolved
/// stored message. Feed these to
/// [`crate::delivery::DeliveryQueues::insert_restored`] when sessions are
/// rebuilt.
#[derive(Debug)]
pub struct RestoredRecord {
    pub record: StoredClientMessage,
    pub base: Arc<BaseMessage>,
}

/// Shared delivery context of a broker instance.
pub struct Broker {
    store: MessageStore,
    ids: MessageIdGenerator,
}

impl Broker {
    /// Initialize the delivery context from configuration.
    pub fn open(config: &Config) -> Self {
        Self {
            store: MessageStore::new(),
            ids: MessageIdGenerator::new(config.store.node_id),
        }
    }

    /// Initialize with a persistence sink; store removals and delivery
    /// mutations will be notified to it.
    pub fn open_with_persister(config: &Config, persister: Arc<dyn Persister>) -> Self {
        Self {
            store: MessageStore::with_persister(persister),
            ids: MessageIdGenerator::new(config.store.node_id),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn ids(&self) -> &MessageIdGenerator {
        &self.ids
    }

    /// Publish a message through the store and the subscription matcher.
    /// The convenience path for broker-originated publishes.
    pub fn publish(
        &self,
        matcher: &mut dyn Matcher,
        request: PublishRequest,
        now: u64,
    ) -> Result<(), DeliveryError> {
        self.store.easy_queue(&self.ids, matcher, request, now)
    }

    /// Rebuild the shared store from persisted data.
    ///
    /// Inserts every stored message, re-seeds the id generator so new ids
    /// stay monotonic, and resolves each delivery record against its
    /// message, grouped by client id. After the session layer has
    /// re-attached all records, run [`MessageStore::compact`] to release
    /// messages nothing referenced.
    pub fn restore(&self, data: LoadedData) -> AHashMap<String, Vec<RestoredRecord>> {
        self.ids.seed(data.max_db_id());

        for stored in data.base_messages {
            let base = Arc::new(stored.into_base_message());
            let id = base.id;
            if self.store.add(base).is_err() {
                warn!(id, "duplicate stored message id ignored during restore");
            }
        }

        let mut sessions: AHashMap<String, Vec<RestoredRecord>> = AHashMap::new();
        for (client_id, record) in data.client_messages {
            match self.store.get(record.db_id) {
                Some(base) => {
                    sessions
                        .entry(client_id)
                        .or_default()
                        .push(RestoredRecord { record, base });
                }
                None => warn!(
                    client_id = %client_id,
                    cmsg_id = record.cmsg_id,
                    db_id = record.db_id,
                    "delivery record references missing stored message, skipped"
                ),
            }
        }

        info!(
            messages = self.store.len(),
            sessions = sessions.len(),
            "message store restored"
        );
        sessions
    }

    /// Tear down at shutdown. Nothing is notified: persisted state must
    /// survive for the next start.
    pub fn close(&self) {
        self.store.clean();
    }
}
