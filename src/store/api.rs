// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local reads and writes.

use std::collections::BTreeSet;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use super::{Database, EventKind, Origin};
use crate::document::{Document, DocumentHead, DocumentState};
use crate::error::DbError;
use crate::revision::{merge_revision, new_revision, Revision, RevisionHistory};

/// Doc ids are non-empty and limited to `[A-Za-z0-9._%-]`.
pub(crate) fn validate_doc_id(doc_id: &str) -> Result<(), DbError> {
    let valid = !doc_id.is_empty()
        && doc_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidDocId(doc_id.to_string()))
    }
}

/// Live content must be a JSON object.
pub(crate) fn validate_content(doc_id: &str, content: &Value) -> Result<(), DbError> {
    if content.is_object() {
        Ok(())
    } else {
        Err(DbError::InvalidContent {
            doc_id: doc_id.to_string(),
            reason: "content must be a JSON object".to_string(),
        })
    }
}

fn check_expected(doc_id: &str, state: Option<&DocumentState>, expected: Option<&Revision>) -> Result<(), DbError> {
    let actual = state.map(|s| &s.current().revision);
    if actual == expected {
        Ok(())
    } else {
        Err(DbError::RevisionConflict {
            doc_id: doc_id.to_string(),
            expected: expected.cloned(),
            actual: actual.cloned(),
        })
    }
}

impl Database {
    /// Current document, tombstones included.
    pub async fn get(&self, doc_id: &str) -> Result<Document, DbError> {
        let start = Instant::now();
        let result = self
            .backend()
            .load(doc_id)
            .await?
            .map(|state| state.to_document())
            .ok_or_else(|| DbError::NotFound(doc_id.to_string()));
        crate::metrics::record_latency("get", start.elapsed());
        result
    }

    /// Write `content` on top of `expected` (`None` for a new document).
    ///
    /// Fails with [`DbError::RevisionConflict`] unless `expected` is exactly
    /// the current revision. Any conflicts the document carries are folded
    /// into the new revision's history, so a local write also resolves them.
    pub async fn put(&self, doc_id: &str, content: Value, expected: Option<&Revision>) -> Result<Revision, DbError> {
        validate_doc_id(doc_id)?;
        validate_content(doc_id, &content)?;
        self.write(doc_id, Some(content), expected, "put").await
    }

    /// Replace the document with a tombstone. Same CAS rules as [`put`](Self::put).
    pub async fn delete(&self, doc_id: &str, expected: &Revision) -> Result<Revision, DbError> {
        validate_doc_id(doc_id)?;
        self.write(doc_id, None, Some(expected), "delete").await
    }

    async fn write(
        &self,
        doc_id: &str,
        content: Option<Value>,
        expected: Option<&Revision>,
        operation: &'static str,
    ) -> Result<Revision, DbError> {
        let start = Instant::now();
        let _guard = self.lock_doc(doc_id).await;

        let existing = self.backend().load(doc_id).await?;
        let deleting = content.is_none();
        if deleting && existing.is_none() {
            return Err(DbError::NotFound(doc_id.to_string()));
        }
        if let Err(e) = check_expected(doc_id, existing.as_ref(), expected) {
            crate::metrics::record_operation(operation, "rejected");
            return Err(e);
        }
        if deleting && existing.as_ref().is_some_and(DocumentState::is_tombstone) {
            crate::metrics::record_operation(operation, "rejected");
            return Err(DbError::AlreadyDeleted(doc_id.to_string()));
        }

        let max = self.config().max_history;
        let (head, kind) = match &existing {
            None => (
                DocumentHead {
                    revision: new_revision(None, self.replica_uid(), content.as_ref()),
                    content,
                    history: RevisionHistory::new(),
                },
                EventKind::Created,
            ),
            Some(state) => {
                let current = state.current();
                let history = RevisionHistory::merge_of(
                    state.heads().iter().map(|h| (&h.revision, &h.history)),
                    max,
                );
                let kind = if deleting {
                    EventKind::Deleted
                } else if state.has_conflicts() {
                    EventKind::Resolved
                } else if state.is_tombstone() {
                    EventKind::Created
                } else {
                    EventKind::Updated
                };
                (
                    DocumentHead {
                        revision: new_revision(Some(&current.revision), self.replica_uid(), content.as_ref()),
                        content,
                        history,
                    },
                    kind,
                )
            }
        };

        let revision = head.revision.clone();
        let state = DocumentState::new(doc_id, head);
        let record = self.commit(&state, kind, Origin::Local).await?;

        debug!(doc_id = %doc_id, revision = %revision, generation = record.generation, "Local {}", operation);
        crate::metrics::record_operation(operation, "success");
        crate::metrics::record_latency(operation, start.elapsed());
        Ok(revision)
    }

    /// Replace every head of a conflicted document with one merge revision.
    ///
    /// `resolved` must name exactly the conflict revisions, optionally
    /// together with the current revision; anything else means the caller's
    /// view is stale and fails with [`DbError::ConflictMismatch`]. `None`
    /// content resolves to a tombstone.
    pub async fn resolve_conflicts(
        &self,
        doc_id: &str,
        content: Option<Value>,
        resolved: &[Revision],
    ) -> Result<Revision, DbError> {
        validate_doc_id(doc_id)?;
        if let Some(content) = &content {
            validate_content(doc_id, content)?;
        }

        let _guard = self.lock_doc(doc_id).await;
        let state = self
            .backend()
            .load(doc_id)
            .await?
            .ok_or_else(|| DbError::NotFound(doc_id.to_string()))?;

        let wanted: BTreeSet<&Revision> = resolved.iter().collect();
        let conflicts: BTreeSet<&Revision> = state.conflicts().iter().map(|h| &h.revision).collect();
        let mut all = conflicts.clone();
        all.insert(&state.current().revision);

        if conflicts.is_empty() || (wanted != conflicts && wanted != all) {
            warn!(doc_id = %doc_id, "Conflict resolution against a stale conflict set");
            crate::metrics::record_operation("resolve", "rejected");
            return Err(DbError::ConflictMismatch {
                doc_id: doc_id.to_string(),
            });
        }

        let heads: Vec<Revision> = state.heads().iter().map(|h| h.revision.clone()).collect();
        let revision = merge_revision(&heads, self.replica_uid(), content.as_ref())
            .ok_or_else(|| DbError::ConflictMismatch {
                doc_id: doc_id.to_string(),
            })?;
        let history = RevisionHistory::merge_of(
            state.heads().iter().map(|h| (&h.revision, &h.history)),
            self.config().max_history,
        );

        let merged = DocumentState::new(
            doc_id,
            DocumentHead {
                revision: revision.clone(),
                content,
                history,
            },
        );
        self.commit(&merged, EventKind::Resolved, Origin::Local).await?;
        crate::metrics::record_operation("resolve", "success");
        debug!(doc_id = %doc_id, revision = %revision, resolved = heads.len(), "Resolved conflicts");
        Ok(revision)
    }

    /// Every document ordered by id, tombstones included.
    pub async fn all_documents(&self) -> Result<Vec<Document>, DbError> {
        Ok(self
            .backend()
            .load_all()
            .await?
            .iter()
            .map(DocumentState::to_document)
            .collect())
    }

    /// Full head set with histories.
    pub async fn document_state(&self, doc_id: &str) -> Result<Option<DocumentState>, DbError> {
        Ok(self.backend().load(doc_id).await?)
    }
}
