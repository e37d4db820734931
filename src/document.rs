// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document data structures.
//!
//! - [`Document`] is what callers read and write: id, revision, JSON content
//!   (or a tombstone) and the unresolved conflicts.
//! - [`DocumentState`] is what the store persists: the set of *heads*, i.e.
//!   the maximal revisions seen for one document id. The greatest head is the
//!   current revision, the rest are conflicts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::revision::{Revision, RevisionHistory};

/// A document as seen by callers.
///
/// # Example
///
/// ```
/// use docsync::Document;
/// use serde_json::json;
///
/// let doc = Document::new("recipe.pancakes", json!({"eggs": 2}));
/// assert!(doc.revision.is_none());
/// assert_eq!(doc.get("eggs"), Some(&json!(2)));
/// assert!(!doc.has_conflicts());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    /// `None` until the document has been stored
    pub revision: Option<Revision>,
    /// `None` marks a tombstone
    pub content: Option<Value>,
    /// Divergent versions awaiting resolution, greatest revision first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
}

/// One unresolved divergent version of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub revision: Revision,
    pub content: Option<Value>,
}

impl Document {
    /// A new, not yet stored document.
    pub fn new(doc_id: impl Into<String>, content: Value) -> Self {
        Self {
            doc_id: doc_id.into(),
            revision: None,
            content: Some(content),
            conflicts: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.content.is_none()
    }

    /// Top-level field of the JSON content.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.as_ref().and_then(|c| c.get(key))
    }

    /// Nested lookup with a JSON pointer, e.g. `/address/city`.
    #[must_use]
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.content.as_ref().and_then(|c| c.pointer(pointer))
    }

    /// Replace the content. Takes effect on the next `put_doc`.
    pub fn set_content(&mut self, content: Value) {
        self.content = Some(content);
    }

    /// Content serialized as JSON text, `None` for tombstones.
    #[must_use]
    pub fn content_json(&self) -> Option<String> {
        self.content.as_ref().map(Value::to_string)
    }
}

/// One head of a document: a revision nothing else seen descends from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHead {
    pub revision: Revision,
    pub content: Option<Value>,
    #[serde(default)]
    pub history: RevisionHistory,
}

impl DocumentHead {
    /// True when `other` is recorded as an ancestor of this head.
    #[must_use]
    pub fn descends_from(&self, other: &Revision) -> bool {
        self.history.contains(other)
    }
}

/// Result of merging one incoming head into a document's state.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The exact revision is already a head
    Duplicate,
    /// The incoming revision is an ancestor of an existing head
    Stale,
    /// The incoming revision now is the only head
    Superseded(DocumentState),
    /// The incoming revision is concurrent with at least one remaining head
    Conflicted(DocumentState),
    /// The incoming revision is concurrent with a head holding the same
    /// content, and the two collapsed into the greater revision
    Folded(DocumentState),
}

/// Persisted per-document state: the heads, greatest revision first.
///
/// Invariant: never empty, no head descends from another head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredHeads")]
pub struct DocumentState {
    pub doc_id: String,
    heads: Vec<DocumentHead>,
}

#[derive(Deserialize)]
struct StoredHeads {
    doc_id: String,
    heads: Vec<DocumentHead>,
}

impl TryFrom<StoredHeads> for DocumentState {
    type Error = String;

    fn try_from(stored: StoredHeads) -> Result<Self, Self::Error> {
        let missing = format!("document {} has no heads", stored.doc_id);
        Self::from_heads(stored.doc_id, stored.heads).ok_or(missing)
    }
}

impl DocumentState {
    /// State with a single head.
    pub fn new(doc_id: impl Into<String>, head: DocumentHead) -> Self {
        Self {
            doc_id: doc_id.into(),
            heads: vec![head],
        }
    }

    /// Rebuild from stored heads. Returns `None` for an empty set.
    #[must_use]
    pub fn from_heads(doc_id: impl Into<String>, mut heads: Vec<DocumentHead>) -> Option<Self> {
        if heads.is_empty() {
            return None;
        }
        heads.sort_by(|a, b| b.revision.cmp(&a.revision));
        heads.dedup_by(|a, b| a.revision == b.revision);
        Some(Self {
            doc_id: doc_id.into(),
            heads,
        })
    }

    /// The surfaced head new local writes must build on.
    #[must_use]
    pub fn current(&self) -> &DocumentHead {
        &self.heads[0]
    }

    #[must_use]
    pub fn conflicts(&self) -> &[DocumentHead] {
        &self.heads[1..]
    }

    #[must_use]
    pub fn heads(&self) -> &[DocumentHead] {
        &self.heads
    }

    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        self.heads.len() > 1
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.current().content.is_none()
    }

    #[must_use]
    pub fn has_head(&self, rev: &Revision) -> bool {
        self.heads.iter().any(|h| &h.revision == rev)
    }

    /// Merge an incoming head.
    ///
    /// Heads the incoming revision descends from are dropped, the incoming one
    /// is added unless it is already known or stale. A concurrent head with
    /// identical content is not kept twice: the smaller of the two revisions
    /// is folded into the greater one's history. The result depends only on
    /// the set of revisions seen, not on arrival order.
    #[must_use]
    pub fn merge(&self, incoming: DocumentHead, max_history: usize) -> MergeOutcome {
        if self.has_head(&incoming.revision) {
            return MergeOutcome::Duplicate;
        }
        if self.heads.iter().any(|h| h.descends_from(&incoming.revision)) {
            return MergeOutcome::Stale;
        }

        let mut heads: Vec<DocumentHead> = self
            .heads
            .iter()
            .filter(|h| !incoming.descends_from(&h.revision))
            .cloned()
            .collect();
        let folded = match heads.iter().position(|h| h.content == incoming.content) {
            Some(index) => {
                let twin = heads.swap_remove(index);
                heads.push(fold_heads(twin, incoming, max_history));
                true
            }
            None => {
                heads.push(incoming);
                false
            }
        };
        heads.sort_by(|a, b| b.revision.cmp(&a.revision));

        let single = heads.len() == 1;
        let state = Self {
            doc_id: self.doc_id.clone(),
            heads,
        };
        if folded {
            MergeOutcome::Folded(state)
        } else if single {
            MergeOutcome::Superseded(state)
        } else {
            MergeOutcome::Conflicted(state)
        }
    }

    /// Caller-facing view.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let current = self.current();
        Document {
            doc_id: self.doc_id.clone(),
            revision: Some(current.revision.clone()),
            content: current.content.clone(),
            conflicts: self
                .conflicts()
                .iter()
                .map(|h| Conflict {
                    revision: h.revision.clone(),
                    content: h.content.clone(),
                })
                .collect(),
        }
    }
}

/// Collapse two concurrent heads with the same content into the greater
/// revision, which then descends from the smaller one.
fn fold_heads(a: DocumentHead, b: DocumentHead, max_history: usize) -> DocumentHead {
    let (mut kept, dropped) = if a.revision > b.revision { (a, b) } else { (b, a) };
    kept.history = RevisionHistory::from_revisions(
        kept.history
            .iter()
            .chain(std::iter::once(&dropped.revision))
            .chain(dropped.history.iter())
            .cloned(),
        max_history,
    );
    kept
}
