//! Storage backend trait for persistence.
//!
//! This trait defines the interface for persistence backends, allowing
//! different implementations (fjall, Redis, PostgreSQL, etc.)

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredBaseMessage, StoredClientMessage};

/// Persistence operation for batch writes.
///
/// One op fires per state-changing delivery mutation; the background writer
/// batches and commits them.
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    /// Store a shared message
    BaseMessageAdd { message: StoredBaseMessage },
    /// Remove a shared message nothing references anymore
    BaseMessageDelete { db_id: u64 },
    /// Store a delivery record
    ClientMessageAdd {
        client_id: String,
        message: StoredClientMessage,
    },
    /// Advance a delivery record's handshake state
    ClientMessageUpdate {
        client_id: String,
        cmsg_id: u64,
        state: u8,
        dup: bool,
    },
    /// Remove a delivery record
    ClientMessageDelete { client_id: String, cmsg_id: u64 },
}

impl PersistenceOp {
    /// Short op name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BaseMessageAdd { .. } => "base_message_add",
            Self::BaseMessageDelete { .. } => "base_message_delete",
            Self::ClientMessageAdd { .. } => "client_message_add",
            Self::ClientMessageUpdate { .. } => "client_message_update",
            Self::ClientMessageDelete { .. } => "client_message_delete",
        }
    }
}

/// Storage backend trait for message persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Shared messages
    // ========================================================================

    /// Get a stored message by id
    async fn get_base_message(&self, db_id: u64) -> Result<Option<StoredBaseMessage>>;

    /// Store a message
    async fn set_base_message(&self, message: &StoredBaseMessage) -> Result<()>;

    /// Delete a stored message
    async fn delete_base_message(&self, db_id: u64) -> Result<()>;

    /// List all stored messages
    async fn list_base_messages(&self) -> Result<Vec<StoredBaseMessage>>;

    // ========================================================================
    // Delivery records
    // ========================================================================

    /// Get a delivery record by client id and cmsg id
    async fn get_client_message(
        &self,
        client_id: &str,
        cmsg_id: u64,
    ) -> Result<Option<StoredClientMessage>>;

    /// Store a delivery record
    async fn set_client_message(
        &self,
        client_id: &str,
        message: &StoredClientMessage,
    ) -> Result<()>;

    /// Delete a delivery record
    async fn delete_client_message(&self, client_id: &str, cmsg_id: u64) -> Result<()>;

    /// List all delivery records with their client ids
    async fn list_client_messages(&self) -> Result<Vec<(String, StoredClientMessage)>>;

    // ========================================================================
    // Batch operations
    // ========================================================================

    /// Execute a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()>;

    /// Close the backend (flush and release resources)
    async fn close(&self) -> Result<()>;

    /// Load all data at startup
    async fn load_all(&self) -> Result<LoadedData> {
        let base_messages = self.list_base_messages().await?;
        let client_messages = self.list_client_messages().await?;

        Ok(LoadedData {
            base_messages,
            client_messages,
        })
    }
}
