//! Public types for the document store.

use crate::revision::Revision;
use crate::storage::traits::Checkpoint;

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A call on this database (`put`, `delete`, `resolve_conflicts`)
    Local,
    /// A record received from a peer during sync
    Sync,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// First live revision (new id, or a write on top of a tombstone)
    Created,
    Updated,
    Deleted,
    /// A concurrent revision arrived and was kept as a conflict
    Conflicted,
    /// The conflict set was cleared
    Resolved,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Updated => write!(f, "Updated"),
            Self::Deleted => write!(f, "Deleted"),
            Self::Conflicted => write!(f, "Conflicted"),
            Self::Resolved => write!(f, "Resolved"),
        }
    }
}

/// Change notification sent to [`Database::subscribe`](super::Database::subscribe) receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocEvent {
    pub doc_id: String,
    /// Current revision after the change
    pub revision: Revision,
    pub kind: EventKind,
    pub origin: Origin,
    /// Generation of the change record
    pub generation: u64,
}

/// Outcome of applying one remote revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Document was unknown locally
    Inserted,
    /// Incoming revision descends from every local head
    Superseded,
    /// Incoming revision is concurrent with a local head
    Conflicted,
    /// Incoming revision matched the content of a concurrent local head
    /// and was folded into it
    Folded,
    /// Already a head, nothing written
    Duplicate,
    /// Ancestor of a local head, nothing written
    Stale,
}

impl ApplyOutcome {
    /// True when the apply wrote a change record.
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted | Self::Superseded | Self::Conflicted | Self::Folded)
    }
}

/// Identity, generation and peer checkpoints of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaState {
    pub replica_uid: String,
    pub generation: u64,
    pub transaction_id: Option<String>,
    /// Last incorporated generation per peer replica uid
    pub checkpoints: Vec<(String, Checkpoint)>,
}
