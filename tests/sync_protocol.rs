//! Sync protocol tests between in-process replicas.
//!
//! Every replica is an in-memory [`Database`]; sessions run through
//! [`LocalTarget`], so the whole protocol path (source session, target
//! responder, wire records) is exercised without a network.
//!
//! # Test Organization
//! - `happy_*` - two-way exchange, convergence, conflict surfacing and resolution
//! - `protocol_*` - checkpoints, early exit, echo suppression, validation failures

use std::sync::Arc;

use serde_json::{json, Value};

use docsync::{
    Database, DatabaseConfig, DbError, Document, DocumentHead, LocalTarget, Revision, RevisionHistory, SyncConfig,
    SyncError, SyncReport, SyncTarget, Synchronizer,
};

// =============================================================================
// Helpers
// =============================================================================

async fn replica(uid: &str) -> Arc<Database> {
    Arc::new(Database::open(DatabaseConfig::in_memory(uid)).await.unwrap())
}

async fn sync(source: &Arc<Database>, target: &Arc<Database>) -> SyncReport {
    Synchronizer::new(source.clone(), SyncConfig::default())
        .sync(&LocalTarget::new(target.clone()))
        .await
        .unwrap()
}

fn rev(s: &str) -> Revision {
    s.parse().unwrap()
}

fn head(revision: &str, ancestors: &[&str], content: Value) -> DocumentHead {
    DocumentHead {
        revision: rev(revision),
        content: Some(content),
        history: RevisionHistory::from_revisions(ancestors.iter().map(|r| rev(r)), 64),
    }
}

async fn documents(db: &Database) -> Vec<Document> {
    db.all_documents().await.unwrap()
}

/// A edits "d1" to 2-ccc, B to 2-bbb, both from 1-aaa, then A syncs with B.
async fn diverged_pair() -> (Arc<Database>, Arc<Database>) {
    let a = replica("a").await;
    let b = replica("b").await;
    a.apply_remote("d1", head("1-aaa", &[], json!({"x": 1}))).await.unwrap();
    sync(&a, &b).await;

    b.apply_remote("d1", head("2-bbb", &["1-aaa"], json!({"x": 2}))).await.unwrap();
    a.apply_remote("d1", head("2-ccc", &["1-aaa"], json!({"x": 3}))).await.unwrap();
    (a, b)
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_concurrent_edits_surface_same_conflict_on_both_sides() {
    let (a, b) = diverged_pair().await;

    let report = sync(&a, &b).await;
    assert_eq!(report.conflicts, 1);

    for db in [&a, &b] {
        let doc = db.get("d1").await.unwrap();
        assert!(doc.has_conflicts());
        assert_eq!(doc.revision, Some(rev("2-ccc")));
        assert_eq!(doc.get("x"), Some(&json!(3)));
        assert_eq!(doc.conflicts.len(), 1);
        assert_eq!(doc.conflicts[0].revision, rev("2-bbb"));
        assert_eq!(doc.conflicts[0].content, Some(json!({"x": 2})));
    }
}

#[tokio::test]
async fn happy_resolution_dominates_both_heads_and_syncs() {
    let (a, b) = diverged_pair().await;
    sync(&a, &b).await;

    let resolved = a
        .resolve_conflicts("d1", Some(json!({"x": 4})), &[rev("2-bbb")])
        .await
        .unwrap();
    assert_eq!(resolved.generation(), 3);

    let state = a.document_state("d1").await.unwrap().unwrap();
    assert!(!state.has_conflicts());
    for ancestor in ["1-aaa", "2-bbb", "2-ccc"] {
        assert!(state.current().descends_from(&rev(ancestor)), "missing {}", ancestor);
    }

    let report = sync(&a, &b).await;
    assert_eq!(report.sent, 1);
    assert_eq!(report.received, 0);

    let doc = b.get("d1").await.unwrap();
    assert!(!doc.has_conflicts());
    assert_eq!(doc.revision, Some(resolved));
    assert_eq!(doc.get("x"), Some(&json!(4)));
}

#[tokio::test]
async fn happy_local_put_over_conflict_clears_it_everywhere() {
    let (a, b) = diverged_pair().await;
    sync(&a, &b).await;

    let current = b.get("d1").await.unwrap().revision.unwrap();
    b.put("d1", json!({"x": "merged by hand"}), Some(&current)).await.unwrap();
    sync(&b, &a).await;

    assert_eq!(documents(&a).await, documents(&b).await);
    assert!(!a.get("d1").await.unwrap().has_conflicts());
}

#[tokio::test]
async fn happy_replicas_converge_after_mixed_edits() {
    let a = replica("a").await;
    let b = replica("b").await;

    let r1 = a.put("shared", json!({"v": 0}), None).await.unwrap();
    a.put("only-a", json!({"a": true}), None).await.unwrap();
    b.put("only-b", json!({"b": true}), None).await.unwrap();
    b.put("both-created", json!({"from": "b"}), None).await.unwrap();
    a.put("both-created", json!({"from": "a"}), None).await.unwrap();
    sync(&a, &b).await;

    let b_rev = b.get("shared").await.unwrap().revision.unwrap();
    b.put("shared", json!({"v": "b"}), Some(&b_rev)).await.unwrap();
    a.put("shared", json!({"v": "a"}), Some(&r1)).await.unwrap();
    let gone = b.get("only-a").await.unwrap().revision.unwrap();
    b.delete("only-a", &gone).await.unwrap();

    for _ in 0..3 {
        sync(&b, &a).await;
        sync(&a, &b).await;
    }

    let docs_a = documents(&a).await;
    assert_eq!(docs_a, documents(&b).await);
    assert_eq!(docs_a.len(), 4);
    assert!(a.get("only-a").await.unwrap().is_tombstone());
    assert!(a.get("shared").await.unwrap().has_conflicts());
    assert!(a.get("both-created").await.unwrap().has_conflicts());

    assert!(sync(&a, &b).await.early_exit);
    assert!(sync(&b, &a).await.early_exit);
}

#[tokio::test]
async fn happy_edits_travel_across_three_replicas() {
    let a = replica("a").await;
    let b = replica("b").await;
    let c = replica("c").await;

    a.put("note", json!({"text": "draft"}), None).await.unwrap();
    sync(&a, &b).await;
    sync(&b, &c).await;

    let base = c.get("note").await.unwrap().revision.unwrap();
    c.put("note", json!({"text": "final"}), Some(&base)).await.unwrap();
    sync(&c, &a).await;
    sync(&a, &b).await;

    for db in [&a, &b, &c] {
        let doc = db.get("note").await.unwrap();
        assert_eq!(doc.get("text"), Some(&json!("final")));
        assert!(!doc.has_conflicts());
    }
}

#[tokio::test]
async fn happy_identical_concurrent_edits_are_recorded_once() {
    let a = replica("a").await;
    let b = replica("b").await;
    let c = replica("c").await;
    a.put("d1", json!({"x": 1}), None).await.unwrap();
    sync(&a, &b).await;
    sync(&a, &c).await;

    for (db, x) in [(&a, 3), (&b, 2), (&c, 2)] {
        let base = db.get("d1").await.unwrap().revision.unwrap();
        db.put("d1", json!({"x": x}), Some(&base)).await.unwrap();
    }
    sync(&a, &b).await;
    sync(&a, &c).await;

    let state = a.document_state("d1").await.unwrap().unwrap();
    let twos = state.heads().iter().filter(|h| h.content == Some(json!({"x": 2}))).count();
    assert_eq!(state.heads().len(), 2);
    assert_eq!(twos, 1);

    sync(&b, &a).await;
    sync(&c, &a).await;
    let expected = documents(&a).await;
    assert_eq!(documents(&b).await, expected);
    assert_eq!(documents(&c).await, expected);
    assert_eq!(expected[0].conflicts.len(), 1);
}

#[tokio::test]
async fn happy_sync_all_reaches_every_target() {
    let hub = replica("hub").await;
    let left = replica("left").await;
    let right = replica("right").await;
    hub.put("broadcast", json!({"n": 1}), None).await.unwrap();
    right.put("from-right", json!({}), None).await.unwrap();

    let targets: Vec<Arc<dyn SyncTarget>> = vec![
        Arc::new(LocalTarget::new(left.clone())),
        Arc::new(LocalTarget::new(right.clone())),
    ];
    let results = Synchronizer::new(hub.clone(), SyncConfig::default())
        .sync_all(&targets)
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap().target_replica_uid, "left");
    assert_eq!(results[1].as_ref().unwrap().received, 1);
    assert!(left.get("broadcast").await.is_ok());
    assert!(right.get("broadcast").await.is_ok());
    assert!(hub.get("from-right").await.is_ok());
}

#[tokio::test]
async fn happy_resolve_to_source_keeps_local_content() {
    let (a, b) = diverged_pair().await;
    let config = SyncConfig {
        resolve_to_source: true,
        ..Default::default()
    };

    let report = Synchronizer::new(a.clone(), config)
        .sync(&LocalTarget::new(b.clone()))
        .await
        .unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.resolved, 1);
    // The resolution is a local write the target has not seen yet
    assert!(!report.recorded_sync_info);

    let doc = a.get("d1").await.unwrap();
    assert!(!doc.has_conflicts());
    assert_eq!(doc.get("x"), Some(&json!(3)));

    sync(&a, &b).await;
    assert_eq!(documents(&a).await, documents(&b).await);
}

// =============================================================================
// Protocol details
// =============================================================================

#[tokio::test]
async fn protocol_empty_replicas_exit_early() {
    let a = replica("a").await;
    let b = replica("b").await;

    let report = sync(&a, &b).await;
    assert!(report.early_exit);
    assert_eq!(report.sent, 0);
    assert_eq!(a.generation().await.unwrap(), 0);
}

#[tokio::test]
async fn protocol_checkpoints_cover_applied_generations() {
    let a = replica("a").await;
    let b = replica("b").await;
    a.put("x", json!({}), None).await.unwrap();
    b.put("y", json!({}), None).await.unwrap();

    let report = sync(&a, &b).await;
    assert!(report.recorded_sync_info);
    assert_eq!(report.source_generation, 1);
    assert_eq!(report.target_generation, 2);

    let a_state = a.replica_state().await.unwrap();
    let b_state = b.replica_state().await.unwrap();
    let b_knows_a = b_state.checkpoints.iter().find(|(uid, _)| uid == "a").unwrap();
    let a_knows_b = a_state.checkpoints.iter().find(|(uid, _)| uid == "b").unwrap();
    assert_eq!(b_knows_a.1.generation, a_state.generation);
    assert_eq!(b_knows_a.1.transaction_id, a_state.transaction_id);
    assert_eq!(a_knows_b.1.generation, b_state.generation);
}

#[tokio::test]
async fn protocol_received_records_are_not_echoed_back() {
    let a = replica("a").await;
    let b = replica("b").await;
    a.put("x", json!({"v": 1}), None).await.unwrap();

    let report = sync(&a, &b).await;
    assert_eq!(report.sent, 1);
    assert_eq!(report.received, 0);
    assert_eq!(a.generation().await.unwrap(), 1);
}

#[tokio::test]
async fn protocol_repeated_apply_is_idempotent() {
    let a = replica("a").await;
    let b = replica("b").await;
    a.put("x", json!({"v": 1}), None).await.unwrap();
    sync(&a, &b).await;

    let before = (b.generation().await.unwrap(), documents(&b).await);
    let state = a.document_state("x").await.unwrap().unwrap();
    for head in state.heads() {
        assert_eq!(b.apply_remote("x", head.clone()).await.unwrap(), docsync::ApplyOutcome::Duplicate);
    }
    assert_eq!((b.generation().await.unwrap(), documents(&b).await), before);
}

#[tokio::test]
async fn protocol_cas_rejects_stale_writers() {
    let db = replica("a").await;
    let r1 = db.put("d", json!({"v": 1}), None).await.unwrap();
    let r2 = db.put("d", json!({"v": 2}), Some(&r1)).await.unwrap();
    assert!(r2 > r1);

    match db.put("d", json!({"v": 3}), Some(&r1)).await {
        Err(DbError::RevisionConflict { expected, actual, .. }) => {
            assert_eq!(expected, Some(r1));
            assert_eq!(actual, Some(r2.clone()));
        }
        other => panic!("expected RevisionConflict, got {:?}", other),
    }
    assert_eq!(db.get("d").await.unwrap().revision, Some(r2));
}

#[tokio::test]
async fn protocol_refuses_to_sync_with_own_uid() {
    let a = replica("same").await;
    let twin = replica("same").await;

    let result = Synchronizer::new(a, SyncConfig::default())
        .sync(&LocalTarget::new(twin))
        .await;
    assert!(matches!(result, Err(SyncError::SameReplica(_))));
}

#[tokio::test]
async fn protocol_detects_target_that_lost_history() {
    let a = replica("a").await;
    let b = replica("b").await;
    a.put("x", json!({}), None).await.unwrap();
    b.put("y", json!({}), None).await.unwrap();
    sync(&a, &b).await;

    // Same identity, empty log: a restored or re-created replica
    let reset_b = replica("b").await;
    let result = Synchronizer::new(a.clone(), SyncConfig::default())
        .sync(&LocalTarget::new(reset_b.clone()))
        .await;
    assert!(matches!(
        result,
        Err(SyncError::InvalidGeneration { claimed: 0, known: 2, .. })
    ));

    // And as a source, its stale claim about `a` no longer matches either
    let result = Synchronizer::new(reset_b, SyncConfig::default())
        .sync(&LocalTarget::new(a))
        .await;
    assert!(matches!(result, Err(SyncError::InvalidGeneration { .. })));
}

#[tokio::test]
async fn protocol_tombstones_replicate() {
    let a = replica("a").await;
    let b = replica("b").await;
    let r1 = a.put("gone", json!({"v": 1}), None).await.unwrap();
    sync(&a, &b).await;
    a.delete("gone", &r1).await.unwrap();
    sync(&a, &b).await;

    let doc = b.get("gone").await.unwrap();
    assert!(doc.is_tombstone());
    assert!(matches!(b.delete("gone", doc.revision.as_ref().unwrap()).await, Err(DbError::AlreadyDeleted(_))));
}
