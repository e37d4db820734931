use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::changelog::ChangeRecord;
use crate::document::DocumentState;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Stored data for '{id}' is corrupt: {reason}")]
    Corruption { id: String, reason: String },
}

/// How far this replica has incorporated a peer's change log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(generation: u64, transaction_id: Option<String>) -> Self {
        Self { generation, transaction_id }
    }
}

/// Durable home of one replica: documents, change log, peer checkpoints.
///
/// `commit` is the only mutation of documents. It writes the new document
/// state, appends a change record and bumps the generation counter as one
/// all-or-nothing unit. Callers hold the document's lock around the
/// read-modify-commit sequence; the backend only guarantees atomicity.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Immutable identity, fixed when the database was created.
    fn replica_uid(&self) -> &str;

    /// Current generation and the transaction id that produced it.
    async fn generation(&self) -> Result<Checkpoint, StorageError>;

    async fn load(&self, doc_id: &str) -> Result<Option<DocumentState>, StorageError>;

    /// All documents ordered by id.
    async fn load_all(&self) -> Result<Vec<DocumentState>, StorageError>;

    async fn commit(&self, state: &DocumentState, transaction_id: &str) -> Result<ChangeRecord, StorageError>;

    /// Up to `limit` records with generation > `generation`, ascending.
    async fn changes_since(&self, generation: u64, limit: usize) -> Result<Vec<ChangeRecord>, StorageError>;

    /// Transaction id recorded at `generation`, `None` if there is no such record.
    async fn transaction_id_at(&self, generation: u64) -> Result<Option<String>, StorageError>;

    async fn checkpoint(&self, peer_uid: &str) -> Result<Option<Checkpoint>, StorageError>;

    async fn set_checkpoint(&self, peer_uid: &str, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// Every known peer checkpoint.
    async fn checkpoints(&self) -> Result<Vec<(String, Checkpoint)>, StorageError>;
}
