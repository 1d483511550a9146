//! EmberMQ - MQTT message delivery core
//!
//! The per-client delivery engine of an MQTT v3.1.1/v5.0 broker: tracks
//! outstanding publishes, sequences QoS 1/2 handshakes, enforces inflight
//! and queue budgets, and carries persistent sessions across reconnects.
//! Transport, packet codec, subscription matching, and retained storage are
//! collaborators behind the `PacketSink`, `Matcher`, and `Persister` seams.

pub mod broker;
pub mod config;
pub mod delivery;
pub mod metrics;
pub mod persistence;
pub mod protocol;
pub mod store;

pub use broker::{Broker, RestoredRecord};
pub use config::Config;
pub use delivery::{
    BridgeBehavior, ClientMessage, DeliveryCounters, DeliveryQueues, DeliveryState, Direction,
    InsertOutcome, MessageState, PacketSink, PublishOut,
};
pub use metrics::{Metrics, MetricsServer};
pub use persistence::{
    FjallBackend, PersistenceManager, PersistenceOp, Persister, StorageBackend,
};
pub use protocol::{DeliveryError, MessageOrigin, Properties, ProtocolVersion, QoS, SendError};
pub use store::{BaseMessage, Matcher, MessageIdGenerator, MessageStore, PublishRequest};
