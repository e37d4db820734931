use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::traits::{Checkpoint, DocumentBackend, StorageError};
use crate::changelog::ChangeRecord;
use crate::document::DocumentState;

#[derive(Default)]
struct MemoryState {
    docs: BTreeMap<String, DocumentState>,
    log: Vec<ChangeRecord>,
    checkpoints: HashMap<String, Checkpoint>,
}

/// Volatile backend. One lock covers documents, log and counter, which is
/// what makes `commit` atomic.
pub struct MemoryBackend {
    replica_uid: String,
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(replica_uid: impl Into<String>) -> Self {
        Self {
            replica_uid: replica_uid.into(),
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Number of stored documents, tombstones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().docs.is_empty()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    fn replica_uid(&self) -> &str {
        &self.replica_uid
    }

    async fn generation(&self) -> Result<Checkpoint, StorageError> {
        let state = self.state.read();
        Ok(state.log.last().map_or_else(Checkpoint::default, |r| {
            Checkpoint::new(r.generation, Some(r.transaction_id.clone()))
        }))
    }

    async fn load(&self, doc_id: &str) -> Result<Option<DocumentState>, StorageError> {
        Ok(self.state.read().docs.get(doc_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<DocumentState>, StorageError> {
        Ok(self.state.read().docs.values().cloned().collect())
    }

    async fn commit(&self, doc: &DocumentState, transaction_id: &str) -> Result<ChangeRecord, StorageError> {
        let mut state = self.state.write();
        // Log is never truncated, so its length is the generation counter
        let record = ChangeRecord {
            generation: state.log.len() as u64 + 1,
            doc_id: doc.doc_id.clone(),
            revision: doc.current().revision.clone(),
            transaction_id: transaction_id.to_string(),
        };
        state.docs.insert(doc.doc_id.clone(), doc.clone());
        state.log.push(record.clone());
        Ok(record)
    }

    async fn changes_since(&self, generation: u64, limit: usize) -> Result<Vec<ChangeRecord>, StorageError> {
        let state = self.state.read();
        let start = usize::try_from(generation).unwrap_or(usize::MAX).min(state.log.len());
        Ok(state.log[start..].iter().take(limit).cloned().collect())
    }

    async fn transaction_id_at(&self, generation: u64) -> Result<Option<String>, StorageError> {
        if generation == 0 {
            return Ok(None);
        }
        let state = self.state.read();
        let index = usize::try_from(generation - 1).unwrap_or(usize::MAX);
        Ok(state.log.get(index).map(|r| r.transaction_id.clone()))
    }

    async fn checkpoint(&self, peer_uid: &str) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.state.read().checkpoints.get(peer_uid).cloned())
    }

    async fn set_checkpoint(&self, peer_uid: &str, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.state
            .write()
            .checkpoints
            .insert(peer_uid.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<(String, Checkpoint)>, StorageError> {
        let mut all: Vec<(String, Checkpoint)> = self
            .state
            .read()
            .checkpoints
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}
