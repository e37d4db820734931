//! Applying revisions received from peers.

use tracing::{debug, warn};

use super::{ApplyOutcome, Database, EventKind, Origin};
use crate::document::{DocumentHead, DocumentState, MergeOutcome};
use crate::error::DbError;

impl Database {
    /// Merge one remote head into the local document, under the same
    /// per-document lock local writes use.
    ///
    /// Idempotent: a revision that is already a head, or that a head already
    /// descends from, writes nothing and appends no change record.
    pub async fn apply_remote(&self, doc_id: &str, mut incoming: DocumentHead) -> Result<ApplyOutcome, DbError> {
        super::api::validate_doc_id(doc_id)?;
        if let Some(content) = &incoming.content {
            super::api::validate_content(doc_id, content)?;
        }
        incoming.history.normalize(self.config().max_history);

        let _timer = crate::metrics::LatencyTimer::new("apply");
        let _guard = self.lock_doc(doc_id).await;
        let revision = incoming.revision.clone();

        let (outcome, next, kind) = match self.backend().load(doc_id).await? {
            None => {
                let kind = if incoming.content.is_some() {
                    EventKind::Created
                } else {
                    EventKind::Deleted
                };
                (ApplyOutcome::Inserted, Some(DocumentState::new(doc_id, incoming)), kind)
            }
            Some(local) => match local.merge(incoming, self.config().max_history) {
                MergeOutcome::Duplicate => (ApplyOutcome::Duplicate, None, EventKind::Updated),
                MergeOutcome::Stale => (ApplyOutcome::Stale, None, EventKind::Updated),
                MergeOutcome::Superseded(next) => {
                    let kind = if local.has_conflicts() {
                        EventKind::Resolved
                    } else if next.is_tombstone() {
                        EventKind::Deleted
                    } else if local.is_tombstone() {
                        EventKind::Created
                    } else {
                        EventKind::Updated
                    };
                    (ApplyOutcome::Superseded, Some(next), kind)
                }
                MergeOutcome::Conflicted(next) => {
                    warn!(
                        doc_id = %doc_id,
                        revision = %revision,
                        heads = next.heads().len(),
                        "Concurrent revision kept as conflict"
                    );
                    crate::metrics::record_conflict("sync");
                    (ApplyOutcome::Conflicted, Some(next), EventKind::Conflicted)
                }
                MergeOutcome::Folded(next) => {
                    debug!(doc_id = %doc_id, revision = %revision, "Identical concurrent content folded into one head");
                    let kind = if next.has_conflicts() {
                        EventKind::Conflicted
                    } else if local.has_conflicts() {
                        EventKind::Resolved
                    } else {
                        EventKind::Updated
                    };
                    (ApplyOutcome::Folded, Some(next), kind)
                }
            },
        };

        if let Some(next) = next {
            let record = self.commit(&next, kind, Origin::Sync).await?;
            debug!(doc_id = %doc_id, revision = %revision, generation = record.generation, ?outcome, "Applied remote revision");
        } else {
            debug!(doc_id = %doc_id, revision = %revision, ?outcome, "Remote revision already known");
        }
        crate::metrics::record_operation("apply", "success");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::revision::{Revision, RevisionHistory};
    use serde_json::{json, Value};

    fn head(rev: &str, ancestors: &[&str], content: Option<Value>) -> DocumentHead {
        DocumentHead {
            revision: rev.parse().unwrap(),
            content,
            history: RevisionHistory::from_revisions(ancestors.iter().map(|r| r.parse::<Revision>().unwrap()), 64),
        }
    }

    async fn db() -> Database {
        Database::open(DatabaseConfig::in_memory("apply-test")).await.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_doc_is_inserted() {
        let db = db().await;
        let outcome = db.apply_remote("d", head("1-aaa", &[], Some(json!({"x": 1})))).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert_eq!(db.get("d").await.unwrap().get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_reapply_is_noop() {
        let db = db().await;
        let h = head("1-aaa", &[], Some(json!({"x": 1})));
        db.apply_remote("d", h.clone()).await.unwrap();
        let before = db.document_state("d").await.unwrap();
        let gen = db.generation().await.unwrap();

        assert_eq!(db.apply_remote("d", h).await.unwrap(), ApplyOutcome::Duplicate);
        assert_eq!(db.document_state("d").await.unwrap(), before);
        assert_eq!(db.generation().await.unwrap(), gen);
    }

    #[tokio::test]
    async fn test_descendant_supersedes_and_ancestor_is_stale() {
        let db = db().await;
        db.apply_remote("d", head("1-aaa", &[], Some(json!({"v": 1})))).await.unwrap();
        assert_eq!(
            db.apply_remote("d", head("2-bbb", &["1-aaa"], Some(json!({"v": 2})))).await.unwrap(),
            ApplyOutcome::Superseded
        );
        assert_eq!(
            db.apply_remote("d", head("1-aaa", &[], Some(json!({"v": 1})))).await.unwrap(),
            ApplyOutcome::Stale
        );
        assert_eq!(db.get("d").await.unwrap().get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_concurrent_revision_becomes_conflict() {
        let db = db().await;
        let mut events = db.subscribe();
        db.apply_remote("d", head("2-bbb", &["1-aaa"], Some(json!({"x": 2})))).await.unwrap();
        let outcome = db
            .apply_remote("d", head("2-ccc", &["1-aaa"], Some(json!({"x": 3}))))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflicted);

        let doc = db.get("d").await.unwrap();
        assert_eq!(doc.revision.unwrap().to_string(), "2-ccc");
        assert_eq!(doc.conflicts.len(), 1);
        assert_eq!(doc.conflicts[0].content, Some(json!({"x": 2})));

        events.recv().await.unwrap();
        let conflicted = events.recv().await.unwrap();
        assert_eq!(conflicted.kind, EventKind::Conflicted);
        assert_eq!(conflicted.origin, Origin::Sync);
    }

    #[tokio::test]
    async fn test_remote_tombstone_applies() {
        let db = db().await;
        db.apply_remote("d", head("1-a", &[], Some(json!({})))).await.unwrap();
        db.apply_remote("d", head("2-b", &["1-a"], None)).await.unwrap();
        assert!(db.get("d").await.unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_invalid_remote_content_rejected_without_write() {
        let db = db().await;
        let err = db.apply_remote("d", head("1-a", &[], Some(json!("scalar")))).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidContent { .. }));
        assert_eq!(db.generation().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_put_after_conflict_resolves_it() {
        let db = db().await;
        db.apply_remote("d", head("2-bbb", &["1-aaa"], Some(json!({"x": 2})))).await.unwrap();
        db.apply_remote("d", head("2-ccc", &["1-aaa"], Some(json!({"x": 3})))).await.unwrap();
        let current = db.get("d").await.unwrap().revision.unwrap();

        let rev = db.put("d", json!({"x": 4}), Some(&current)).await.unwrap();
        let state = db.document_state("d").await.unwrap().unwrap();
        assert!(!state.has_conflicts());
        assert_eq!(rev.generation(), 3);
        assert!(state.current().descends_from(&"2-bbb".parse().unwrap()));
        assert!(state.current().descends_from(&"2-ccc".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_resolve_conflicts_with_conflict_set() {
        let db = db().await;
        db.apply_remote("d", head("2-bbb", &["1-aaa"], Some(json!({"x": 2})))).await.unwrap();
        db.apply_remote("d", head("2-ccc", &["1-aaa"], Some(json!({"x": 3})))).await.unwrap();
        let doc = db.get("d").await.unwrap();
        let conflict_revs: Vec<Revision> = doc.conflicts.iter().map(|c| c.revision.clone()).collect();

        // A stale view (missing a revision) is rejected
        assert!(matches!(
            db.resolve_conflicts("d", Some(json!({})), &[]).await,
            Err(DbError::ConflictMismatch { .. })
        ));

        let merged = db
            .resolve_conflicts("d", Some(json!({"x": 5})), &conflict_revs)
            .await
            .unwrap();
        assert_eq!(merged.generation(), 3);

        let state = db.document_state("d").await.unwrap().unwrap();
        assert!(!state.has_conflicts());
        for r in ["2-bbb", "2-ccc", "1-aaa"] {
            assert!(state.current().descends_from(&r.parse().unwrap()), "{}", r);
        }

        // Older contenders now arrive as stale
        assert_eq!(
            db.apply_remote("d", head("2-bbb", &["1-aaa"], Some(json!({"x": 2})))).await.unwrap(),
            ApplyOutcome::Stale
        );
    }
}
