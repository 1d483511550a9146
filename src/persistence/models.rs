//! Serializable data models for persistence.
//!
//! Storage-friendly versions of the runtime message types, encoded with
//! bincode. A stored message carries everything needed to rebuild the
//! shared store entry; a stored delivery record references its message by
//! db id and is keyed per client by its cmsg id.

use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::delivery::ClientMessage;
use crate::protocol::{MessageOrigin, Properties, QoS};
use crate::store::BaseMessage;

/// Stored copy of a shared message, keyed by `db_id`
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredBaseMessage {
    pub db_id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    /// 0 = client, 1 = broker, 2 = bridge
    pub origin: u8,
    pub source_id: Option<String>,
    pub source_username: Option<String>,
    pub source_listener: Option<String>,
    pub source_mid: u16,
    /// Absolute expiry instant in unix seconds, 0 = never
    pub expiry_time: u64,
    pub properties: StoredProperties,
}

/// Stored delivery record, keyed by `(client_id, cmsg_id)`
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredClientMessage {
    pub cmsg_id: u64,
    /// The stored message this record references
    pub db_id: u64,
    pub mid: u16,
    pub qos: u8,
    /// Encoded [`crate::delivery::MessageState`]
    pub state: u8,
    /// 0 = in, 1 = out
    pub direction: u8,
    pub dup: bool,
    pub retain: bool,
    pub subscription_identifier: Option<u32>,
}

/// Stored MQTT v5 properties (the delivery-relevant subset)
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
}

// ============================================================================
// Conversion implementations
// ============================================================================

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: props.user_properties.clone(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(stored: StoredProperties) -> Self {
        Properties {
            payload_format_indicator: stored.payload_format_indicator,
            message_expiry_interval: stored.message_expiry_interval,
            content_type: stored.content_type,
            response_topic: stored.response_topic,
            correlation_data: stored.correlation_data.map(Bytes::from),
            user_properties: stored.user_properties,
        }
    }
}

impl From<&BaseMessage> for StoredBaseMessage {
    fn from(base: &BaseMessage) -> Self {
        Self {
            db_id: base.id,
            topic: base.topic.to_string(),
            payload: base.payload.to_vec(),
            qos: base.qos as u8,
            retain: base.retain,
            origin: base.origin as u8,
            source_id: base.source_id.as_ref().map(|id| id.to_string()),
            source_username: base.source_username.clone(),
            source_listener: base.source_listener.clone(),
            source_mid: base.source_mid,
            expiry_time: base.expiry_time,
            properties: StoredProperties::from(&base.properties),
        }
    }
}

impl StoredBaseMessage {
    /// Rebuild the runtime message. The reference count starts at zero and
    /// rises as restored delivery records re-attach.
    pub fn into_base_message(self) -> BaseMessage {
        BaseMessage::new(
            self.db_id,
            self.topic,
            Bytes::from(self.payload),
            QoS::from_u8(self.qos).unwrap_or_default(),
            self.retain,
            MessageOrigin::from_u8(self.origin).unwrap_or_default(),
        )
        .with_properties(Properties::from(self.properties))
        .with_expiry_time(self.expiry_time)
        .with_source(
            self.source_id.map(Arc::from),
            self.source_username,
            self.source_listener,
            self.source_mid,
        )
    }
}

impl StoredClientMessage {
    pub fn from_client_message(msg: &ClientMessage) -> Self {
        Self {
            cmsg_id: msg.cmsg_id,
            db_id: msg.base.id,
            mid: msg.mid,
            qos: msg.qos as u8,
            state: msg.state as u8,
            direction: msg.direction as u8,
            dup: msg.dup,
            retain: msg.retain,
            subscription_identifier: msg.subscription_identifier,
        }
    }
}

/// Data loaded from persistence at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub base_messages: Vec<StoredBaseMessage>,
    pub client_messages: Vec<(String, StoredClientMessage)>,
}

impl LoadedData {
    /// Largest stored message id, used to re-seed the id generator
    pub fn max_db_id(&self) -> u64 {
        self.base_messages
            .iter()
            .map(|m| m.db_id)
            .max()
            .unwrap_or(0)
    }
}
