// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store.
//!
//! [`Database`] is one replica: a [`DocumentBackend`] plus the per-document
//! locks that serialize every read-modify-commit on the same document id.
//! Local writes (`put`, `delete`, `resolve_conflicts`) and remote applies
//! from sync sessions take the same lock, so a compare-and-swap check, its
//! change record and the generation bump never interleave with another
//! mutation of that document.
//!
//! # Example
//!
//! ```rust
//! use docsync::{Database, DatabaseConfig};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let db = Database::open(DatabaseConfig::in_memory("replica-a")).await.unwrap();
//!
//! let rev = db.put("note-1", json!({"title": "hello"}), None).await.unwrap();
//! let doc = db.get("note-1").await.unwrap();
//! assert_eq!(doc.revision, Some(rev.clone()));
//!
//! // Stale writes are rejected
//! assert!(db.put("note-1", json!({"title": "x"}), None).await.is_err());
//! db.put("note-1", json!({"title": "bye"}), Some(&rev)).await.unwrap();
//! # }
//! ```

mod api;
mod apply;
mod types;

pub use types::{ApplyOutcome, DocEvent, EventKind, Origin, ReplicaState};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::info;

use crate::changelog::{new_transaction_id, ChangeFeed, ChangeRecord};
use crate::config::DatabaseConfig;
use crate::document::DocumentState;
use crate::error::DbError;
use crate::storage::memory::MemoryBackend;
use crate::storage::sql::SqlBackend;
use crate::storage::traits::DocumentBackend;

/// One local replica.
///
/// # Thread Safety
///
/// `Send + Sync`; share it as `Arc<Database>` between tasks and sync sessions.
pub struct Database {
    backend: Arc<dyn DocumentBackend>,
    config: DatabaseConfig,
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<DocEvent>,
}

impl Database {
    /// Open the database described by `config`: SQLite when `path` is set,
    /// in-memory otherwise.
    pub async fn open(config: DatabaseConfig) -> Result<Self, DbError> {
        let backend: Arc<dyn DocumentBackend> = match config.sqlite_url() {
            Some(url) => Arc::new(SqlBackend::open(&url, config.replica_uid.as_deref()).await?),
            None => {
                let uid = config
                    .replica_uid
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                Arc::new(MemoryBackend::new(uid))
            }
        };
        Ok(Self::with_backend(backend, config))
    }

    /// Wrap an already opened backend.
    pub fn with_backend(backend: Arc<dyn DocumentBackend>, config: DatabaseConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        info!(replica_uid = %backend.replica_uid(), "Database ready");
        Self {
            backend,
            config,
            doc_locks: DashMap::new(),
            events,
        }
    }

    #[must_use]
    pub fn replica_uid(&self) -> &str {
        self.backend.replica_uid()
    }

    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Receive a [`DocEvent`] for every committed change.
    ///
    /// Slow receivers lose the oldest events (`RecvError::Lagged`).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.events.subscribe()
    }

    /// Current local generation.
    pub async fn generation(&self) -> Result<u64, DbError> {
        Ok(self.backend.generation().await?.generation)
    }

    /// Identity, generation and every peer checkpoint.
    pub async fn replica_state(&self) -> Result<ReplicaState, DbError> {
        let current = self.backend.generation().await?;
        Ok(ReplicaState {
            replica_uid: self.replica_uid().to_string(),
            generation: current.generation,
            transaction_id: current.transaction_id,
            checkpoints: self.backend.checkpoints().await?,
        })
    }

    /// Change records after `generation`, ascending, up to the generation
    /// current at the time of the call.
    pub async fn list_changed_since(&self, generation: u64) -> Result<ChangeFeed, DbError> {
        let upper = self.backend.generation().await?.generation;
        Ok(ChangeFeed::new(
            self.backend.clone(),
            generation,
            upper,
            self.config.change_page_size,
        ))
    }

    /// Serialize mutations of one document id.
    pub(crate) async fn lock_doc(&self, doc_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .doc_locks
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Persist a new state under a fresh transaction id and notify subscribers.
    /// Caller holds the document lock.
    pub(crate) async fn commit(
        &self,
        state: &DocumentState,
        kind: EventKind,
        origin: Origin,
    ) -> Result<ChangeRecord, DbError> {
        let record = self.backend.commit(state, &new_transaction_id()).await?;
        crate::metrics::set_local_generation(self.replica_uid(), record.generation);
        // No receivers is not an error
        let _ = self.events.send(DocEvent {
            doc_id: record.doc_id.clone(),
            revision: record.revision.clone(),
            kind,
            origin,
            generation: record.generation,
        });
        Ok(record)
    }
}
