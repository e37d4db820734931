//! # docsync
//!
//! Replicated JSON document store with peer-to-peer synchronization.
//!
//! Every replica is a full [`Database`]: documents keyed by id, each write
//! producing a new [`Revision`] and a change record in a monotonically
//! numbered change log. Replicas converge by running sync sessions that
//! exchange the documents changed since each side's last checkpoint of the
//! other. Concurrent edits are never lost: they surface as conflicts that
//! any replica can resolve, and the resolution itself syncs like any edit.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Host application / DocumentApi                │
//! │  • create / get / put / delete / enumerate                 │
//! │  • conflicts + resolve_conflicts                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Database (store)                        │
//! │  • per-document locks, CAS on the current revision         │
//! │  • head-set merge of remote revisions                      │
//! │  • DocEvent broadcast                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              DocumentBackend (memory / SQLite)              │
//! │  • documents + conflicts                                   │
//! │  • transaction log (generation, transaction id)            │
//! │  • peer checkpoints                                        │
//! └─────────────────────────────────────────────────────────────┘
//!
//!   Synchronizer ──── SyncTarget (LocalTarget, CircuitTarget, ...) ──── peer Database
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use docsync::{Database, DatabaseConfig, LocalTarget, SyncConfig, Synchronizer};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let laptop = Arc::new(Database::open(DatabaseConfig::in_memory("laptop")).await.unwrap());
//! let phone = Arc::new(Database::open(DatabaseConfig::in_memory("phone")).await.unwrap());
//!
//! laptop.put("todo-1", json!({"title": "buy milk"}), None).await.unwrap();
//!
//! let sync = Synchronizer::new(laptop.clone(), SyncConfig::default());
//! let report = sync.sync(&LocalTarget::new(phone.clone())).await.unwrap();
//! assert_eq!(report.sent, 1);
//!
//! assert_eq!(phone.get("todo-1").await.unwrap().get("title"), Some(&json!("buy milk")));
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`revision`]: revision ids, bounded histories, causal comparison
//! - [`document`]: documents and the head set of one document id
//! - [`changelog`]: change records and the lazy change feed
//! - [`storage`]: storage backends (memory, SQLite)
//! - [`store`]: the [`Database`]
//! - [`binding`]: the [`DocumentApi`] capability trait
//! - [`sync`]: sync protocol, transports, [`Synchronizer`]
//! - [`resilience`]: retry policies and circuit breakers

pub mod binding;
pub mod changelog;
pub mod config;
pub mod document;
pub mod error;
pub mod metrics;
pub mod resilience;
pub mod revision;
pub mod storage;
pub mod store;
pub mod sync;

pub use binding::DocumentApi;
pub use changelog::{ChangeFeed, ChangeRecord};
pub use config::{DatabaseConfig, SyncConfig};
pub use document::{Conflict, Document, DocumentHead, DocumentState, MergeOutcome};
pub use error::{DbError, SyncError, TransportError};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitTarget};
pub use resilience::retry::RetryConfig;
pub use revision::{Ancestry, Revision, RevisionError, RevisionHistory};
pub use storage::traits::{Checkpoint, DocumentBackend, StorageError};
pub use store::{ApplyOutcome, Database, DocEvent, EventKind, Origin, ReplicaState};
pub use sync::{
    ExchangeRecord, ExchangeRequest, ExchangeResponse, LocalTarget, SkippedRecord, SyncInfo, SyncReport,
    SyncState, SyncTarget, Synchronizer,
};
pub use metrics::LatencyTimer;
