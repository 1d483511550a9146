//! Fjall-based storage backend implementation.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Shared messages live in one partition keyed by the big-endian db id (so
//! iteration order matches id order); delivery records live in another,
//! keyed by client id and cmsg id. MQTT client ids cannot contain NUL, so
//! a NUL byte separates the two key parts.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredBaseMessage, StoredClientMessage};

/// Fjall-based storage backend
pub struct FjallBackend {
    keyspace: Keyspace,
    base_messages: PartitionHandle,
    client_messages: PartitionHandle,
}

impl FjallBackend {
    /// Open a fjall backend at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let base_messages =
            keyspace.open_partition("base_messages", PartitionCreateOptions::default())?;
        let client_messages =
            keyspace.open_partition("client_messages", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            base_messages,
            client_messages,
        })
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    fn client_key(client_id: &str, cmsg_id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(client_id.len() + 9);
        key.extend_from_slice(client_id.as_bytes());
        key.push(0);
        key.extend_from_slice(&cmsg_id.to_be_bytes());
        key
    }

    fn parse_client_key(key: &[u8]) -> Result<String> {
        let sep = key
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PersistenceError::Decode("client message key without separator".into()))?;
        Ok(String::from_utf8_lossy(&key[..sep]).to_string())
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    // ========================================================================
    // Shared messages
    // ========================================================================

    async fn get_base_message(&self, db_id: u64) -> Result<Option<StoredBaseMessage>> {
        match self.base_messages.get(db_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_base_message(&self, message: &StoredBaseMessage) -> Result<()> {
        let bytes = Self::serialize(message)?;
        self.base_messages.insert(message.db_id.to_be_bytes(), bytes)?;
        Ok(())
    }

    async fn delete_base_message(&self, db_id: u64) -> Result<()> {
        self.base_messages.remove(db_id.to_be_bytes())?;
        Ok(())
    }

    async fn list_base_messages(&self) -> Result<Vec<StoredBaseMessage>> {
        let mut result = Vec::new();
        for item in self.base_messages.iter() {
            let (_, value) = item?;
            let message: StoredBaseMessage = Self::deserialize(&value)?;
            result.push(message);
        }
        Ok(result)
    }

    // ========================================================================
    // Delivery records
    // ========================================================================

    async fn get_client_message(
        &self,
        client_id: &str,
        cmsg_id: u64,
    ) -> Result<Option<StoredClientMessage>> {
        match self.client_messages.get(Self::client_key(client_id, cmsg_id))? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_client_message(
        &self,
        client_id: &str,
        message: &StoredClientMessage,
    ) -> Result<()> {
        let bytes = Self::serialize(message)?;
        self.client_messages
            .insert(Self::client_key(client_id, message.cmsg_id), bytes)?;
        Ok(())
    }

    async fn delete_client_message(&self, client_id: &str, cmsg_id: u64) -> Result<()> {
        self.client_messages
            .remove(Self::client_key(client_id, cmsg_id))?;
        Ok(())
    }

    async fn list_client_messages(&self) -> Result<Vec<(String, StoredClientMessage)>> {
        let mut result = Vec::new();
        for item in self.client_messages.iter() {
            let (key, value) = item?;
            let client_id = Self::parse_client_key(&key)?;
            let message: StoredClientMessage = Self::deserialize(&value)?;
            result.push((client_id, message));
        }
        Ok(result)
    }

    // ========================================================================
    // Batch operations
    // ========================================================================

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                PersistenceOp::BaseMessageAdd { message } => {
                    let bytes = Self::serialize(&message)?;
                    batch.insert(&self.base_messages, message.db_id.to_be_bytes(), bytes);
                }
                PersistenceOp::BaseMessageDelete { db_id } => {
                    batch.remove(&self.base_messages, db_id.to_be_bytes());
                }
                PersistenceOp::ClientMessageAdd { client_id, message } => {
                    let bytes = Self::serialize(&message)?;
                    batch.insert(
                        &self.client_messages,
                        Self::client_key(&client_id, message.cmsg_id),
                        bytes,
                    );
                }
                PersistenceOp::ClientMessageUpdate {
                    client_id,
                    cmsg_id,
                    state,
                    dup,
                } => {
                    // Read-modify-write; the update is dropped if the record
                    // was deleted by an earlier op in the meantime
                    let key = Self::client_key(&client_id, cmsg_id);
                    if let Some(bytes) = self.client_messages.get(&key)? {
                        let mut message: StoredClientMessage = Self::deserialize(&bytes)?;
                        message.state = state;
                        message.dup = dup;
                        batch.insert(&self.client_messages, key, Self::serialize(&message)?);
                    }
                }
                PersistenceOp::ClientMessageDelete { client_id, cmsg_id } => {
                    batch.remove(&self.client_messages, Self::client_key(&client_id, cmsg_id));
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Flush before closing; fjall handles cleanup on drop
        self.flush().await?;
        Ok(())
    }
}
