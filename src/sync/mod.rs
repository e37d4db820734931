// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync protocol.
//!
//! One session moves a source database and a [`SyncTarget`] through
//!
//! ```text
//! Init → ExchangeInfo → TransferRecords → Apply → Checkpoint → Done
//!   └──────────┴──────────────┴─────────────┴──────────┴──→ Failed
//! ```
//!
//! - **Init**: ask the target for its identity, generation and its
//!   checkpoint of the source.
//! - **ExchangeInfo**: validate that checkpoint against the local log, load
//!   the local checkpoint of the target, stop early when neither side moved.
//! - **TransferRecords**: one request carrying every head of every document
//!   changed since the target's checkpoint; the response carries the
//!   target's changes since the source's checkpoint.
//! - **Apply**: merge the returned heads; invalid records are skipped.
//! - **Checkpoint**: only now advance the checkpoint of the target, and
//!   tell the target about generations created by the apply itself.
//!
//! A failed or aborted session never advances a checkpoint, so the next
//! session re-requests the same range. Applying is idempotent, so the
//! records a failed session already applied are harmless to replay.

mod local;
mod responder;
mod session;
mod target;

pub use local::LocalTarget;
pub use session::Synchronizer;
pub use target::{ExchangeRecord, ExchangeRequest, ExchangeResponse, SkippedRecord, SyncInfo, SyncTarget};

/// Session state, published through [`Synchronizer::state_receiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No session has run yet
    Idle,
    Init,
    ExchangeInfo,
    TransferRecords,
    Apply,
    Checkpoint,
    Done,
    Failed,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Init => write!(f, "Init"),
            Self::ExchangeInfo => write!(f, "ExchangeInfo"),
            Self::TransferRecords => write!(f, "TransferRecords"),
            Self::Apply => write!(f, "Apply"),
            Self::Checkpoint => write!(f, "Checkpoint"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of one successful session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub source_replica_uid: String,
    pub target_replica_uid: String,
    /// Local generation the sent records were gathered at
    pub source_generation: u64,
    /// Target generation the received records cover
    pub target_generation: u64,
    /// Neither side had changes, nothing was exchanged
    pub early_exit: bool,
    pub sent: usize,
    pub received: usize,
    /// Received records that changed local state
    pub applied: usize,
    /// Documents that gained a conflict in this session
    pub conflicts: usize,
    /// Conflicts resolved in favour of local content (`resolve_to_source`)
    pub resolved: usize,
    /// Received records skipped locally
    pub skipped: Vec<SkippedRecord>,
    /// Sent records the target skipped
    pub target_rejected: Vec<SkippedRecord>,
    /// The target's checkpoint of this replica was raised past the apply
    pub recorded_sync_info: bool,
}
