//! Persistence module for the delivery core.
//!
//! Durable storage for the shared message store and every client's
//! delivery records, so persistent sessions survive a broker restart with
//! their QoS 1/2 handshakes intact. The backend sits behind
//! [`StorageBackend`]; [`FjallBackend`] is the embedded default.
//!
//! Persistence is best-effort by contract: delivery operations hand their
//! notifications to [`PersistenceManager::write`] and never wait. A writer
//! task gathers ops into batches, committing when a batch fills or its
//! flush window lapses, whichever comes first.

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{LoadedData, StoredBaseMessage, StoredClientMessage, StoredProperties};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Ops buffered ahead of the writer before the hot path starts shedding
const PENDING_OP_LIMIT: usize = 8192;

/// Fire-and-forget sink for persistence operations.
///
/// The delivery core and the message store notify every state-changing
/// mutation through this trait; implementations must not block.
pub trait Persister: Send + Sync {
    fn persist(&self, op: PersistenceOp);
}

/// Owns the writer task and the channel feeding it.
///
/// Closing the channel is the shutdown signal: the writer drains whatever
/// is left, commits it, and exits, so [`PersistenceManager::shutdown`] can
/// await completeness instead of guessing with a grace period.
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: Mutex<Option<mpsc::Sender<PersistenceOp>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Start a manager over the given backend, spawning its writer task.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(PENDING_OP_LIMIT);
        let writer = tokio::spawn(Self::run_writer(
            backend.clone(),
            rx,
            flush_interval,
            max_batch_size,
        ));

        Self {
            backend,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Hand an op to the writer without waiting.
    ///
    /// A full channel sheds the op: the delivery path must not stall on
    /// disk, and a restart after shedding only costs a retransmission.
    pub fn write(&self, op: PersistenceOp) {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                if let Err(refused) = tx.try_send(op) {
                    warn!(
                        op = refused.into_inner().kind(),
                        limit = PENDING_OP_LIMIT,
                        "persistence backlog full, operation shed"
                    );
                }
            }
            None => debug!("persistence already shut down, operation ignored"),
        }
    }

    /// Load all data at startup
    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Stop the writer, commit everything it was still holding, and close
    /// the backend.
    pub async fn shutdown(&self) -> Result<()> {
        // Dropping the sender closes the channel; the writer drains and
        // exits on its own
        drop(self.tx.lock().take());

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if writer.await.is_err() {
                error!("persistence writer panicked before shutdown");
            }
        }

        self.backend.flush().await?;
        self.backend.close().await?;
        info!("persistence backend closed");
        Ok(())
    }

    /// Writer task: every batch opens with a blocking receive, then fills
    /// until `max_batch_size` ops are gathered or `flush_interval` has
    /// passed since the batch opened.
    async fn run_writer(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch = Vec::with_capacity(max_batch_size);

        while let Some(op) = rx.recv().await {
            batch.push(op);
            let flush_at = Instant::now() + flush_interval;

            while batch.len() < max_batch_size {
                match timeout_at(flush_at, rx.recv()).await {
                    Ok(Some(op)) => batch.push(op),
                    // Channel closed or the flush window lapsed
                    Ok(None) | Err(_) => break,
                }
            }

            Self::commit(backend.as_ref(), &mut batch).await;
        }

        debug!("persistence writer exited");
    }

    async fn commit(backend: &dyn StorageBackend, batch: &mut Vec<PersistenceOp>) {
        let ops = batch.len();
        match backend.batch_write(std::mem::take(batch)).await {
            Ok(()) => debug!(ops, "persistence batch committed"),
            Err(e) => error!(ops, error = %e, "persistence batch failed"),
        }
    }
}

impl Persister for PersistenceManager {
    fn persist(&self, op: PersistenceOp) {
        self.write(op);
    }
}
