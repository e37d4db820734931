//! Sync target transport interface and wire types.
//!
//! Every type here is serde-serializable, so an HTTP (or any other)
//! transport only has to move these values; [`LocalTarget`](super::LocalTarget)
//! passes them in process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{DocumentHead, DocumentState};
use crate::error::{DbError, TransportError};
use crate::revision::{Revision, RevisionHistory};
use crate::storage::traits::Checkpoint;

/// Answer to `get_sync_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub target_replica_uid: String,
    /// Target's current generation and its transaction id
    pub target_generation: Checkpoint,
    /// How far the target has incorporated the source's log
    pub source_checkpoint: Checkpoint,
}

/// One document head on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub doc_id: String,
    pub revision: Revision,
    /// JSON text, `None` for a tombstone
    pub content: Option<String>,
    #[serde(default)]
    pub history: RevisionHistory,
    /// Sender's generation of the change that produced this record
    pub generation: u64,
    pub transaction_id: String,
}

impl ExchangeRecord {
    /// Encode one head of a stored document.
    #[must_use]
    pub fn from_head(doc_id: &str, head: &DocumentHead, generation: u64, transaction_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            revision: head.revision.clone(),
            content: head.content.as_ref().map(Value::to_string),
            history: head.history.clone(),
            generation,
            transaction_id: transaction_id.to_string(),
        }
    }

    /// Encode every head of `state`.
    #[must_use]
    pub fn from_state(state: &DocumentState, generation: u64, transaction_id: &str) -> Vec<Self> {
        state
            .heads()
            .iter()
            .map(|head| Self::from_head(&state.doc_id, head, generation, transaction_id))
            .collect()
    }

    /// Parse the content back into a head. Malformed JSON is
    /// [`DbError::InvalidContent`].
    pub fn to_head(&self) -> Result<DocumentHead, DbError> {
        let content = match &self.content {
            Some(text) => Some(serde_json::from_str::<Value>(text).map_err(|e| DbError::InvalidContent {
                doc_id: self.doc_id.clone(),
                reason: e.to_string(),
            })?),
            None => None,
        };
        Ok(DocumentHead {
            revision: self.revision.clone(),
            content,
            history: self.history.clone(),
        })
    }
}

/// A record one side refused to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub doc_id: String,
    pub revision: String,
    pub reason: String,
}

/// Source → target half of the single exchange round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub source_replica_uid: String,
    /// Heads of every document the source changed since the target's checkpoint
    pub records: Vec<ExchangeRecord>,
    /// Source's checkpoint of the target; the target answers with changes after it
    pub last_known_target: Checkpoint,
    /// Source generation the records were gathered at
    pub source_generation: Checkpoint,
}

/// Target → source half of the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub records: Vec<ExchangeRecord>,
    /// Target generation the returned records cover
    pub target_generation: Checkpoint,
    /// Source records the target could not apply
    #[serde(default)]
    pub rejected: Vec<SkippedRecord>,
}

/// Remote end of a sync session.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Target identity, generation, and its checkpoint of the source.
    async fn get_sync_info(&self, source_replica_uid: &str) -> Result<SyncInfo, TransportError>;

    /// Apply the source's records and return the target's own changes.
    async fn sync_exchange(&self, request: ExchangeRequest) -> Result<ExchangeResponse, TransportError>;

    /// Raise the target's checkpoint of the source after a clean round.
    async fn record_sync_info(&self, source_replica_uid: &str, checkpoint: Checkpoint) -> Result<(), TransportError>;
}
