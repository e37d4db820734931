// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy.
//!
//! | Error | Raised by | Recovery |
//! |---|---|---|
//! | [`DbError::NotFound`] | reads, writes on unknown ids | none |
//! | [`DbError::RevisionConflict`] | `put`/`delete` CAS | re-read, retry |
//! | [`DbError::ConflictMismatch`] | `resolve_conflicts` | re-read, retry |
//! | [`DbError::InvalidRevision`] | revision parsing | caller bug |
//! | [`DbError::InvalidContent`] | writes, incoming sync records | record skipped |
//! | [`TransportError`] | [`SyncTarget`](crate::SyncTarget) | session restart |
//! | [`SyncError`] | sync sessions | see [`SyncError::is_retryable`] |

use std::time::Duration;

use thiserror::Error;

use crate::revision::{Revision, RevisionError};
use crate::storage::traits::StorageError;

/// Errors from the document store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("revision conflict on '{doc_id}': expected {}, current {}", fmt_rev(.expected), fmt_rev(.actual))]
    RevisionConflict {
        doc_id: String,
        expected: Option<Revision>,
        actual: Option<Revision>,
    },

    #[error("conflict set of '{doc_id}' changed, re-read before resolving")]
    ConflictMismatch { doc_id: String },

    #[error(transparent)]
    InvalidRevision(#[from] RevisionError),

    #[error("invalid content for '{doc_id}': {reason}")]
    InvalidContent { doc_id: String, reason: String },

    #[error("invalid document id '{0}'")]
    InvalidDocId(String),

    #[error("document '{0}' is already deleted")]
    AlreadyDeleted(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn fmt_rev(rev: &Option<Revision>) -> String {
    rev.as_ref().map_or_else(|| "none".to_string(), ToString::to_string)
}

/// Failures talking to a sync target.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("sync target unavailable: {0}")]
    Unavailable(String),

    #[error("sync target failed: {0}")]
    Remote(String),

    #[error("sync target rejected the request: {0}")]
    Rejected(String),

    #[error("circuit open for sync target '{0}'")]
    CircuitOpen(String),
}

/// Errors that abort a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("refusing to sync replica '{0}' with itself")]
    SameReplica(String),

    #[error("inconsistent generation for replica '{replica}': claimed {claimed}, known {known}")]
    InvalidGeneration { replica: String, claimed: u64, known: u64 },

    #[error("transaction id claimed for generation {generation} of replica '{replica}' does not match")]
    InvalidTransactionId { replica: String, generation: u64 },

    #[error("a sync session with '{0}' is already running")]
    SessionInProgress(String),

    #[error("sync session timed out after {0:?}")]
    Timeout(Duration),

    #[error("sync session cancelled")]
    Cancelled,

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Db(DbError::Storage(err))
    }
}

impl SyncError {
    /// True for failures a fresh session from INIT can get past.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(TransportError::Unavailable(_) | TransportError::Remote(_)) => true,
            SyncError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => "transport",
            SyncError::SameReplica(_) => "same_replica",
            SyncError::InvalidGeneration { .. } => "invalid_generation",
            SyncError::InvalidTransactionId { .. } => "invalid_transaction_id",
            SyncError::SessionInProgress(_) => "session_in_progress",
            SyncError::Timeout(_) => "timeout",
            SyncError::Cancelled => "cancelled",
            SyncError::Db(_) => "db",
        }
    }
}
