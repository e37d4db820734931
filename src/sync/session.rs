// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source side of the sync protocol.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::responder::{apply_records, collect_changes, validate_claim};
use super::target::{ExchangeRequest, SyncTarget};
use super::{SyncReport, SyncState};
use crate::config::SyncConfig;
use crate::error::{DbError, SyncError};
use crate::resilience::retry::retry_if;
use crate::revision::Revision;
use crate::store::Database;

/// Drives sync sessions from one local [`Database`] to any number of targets.
///
/// At most one session per peer runs at a time; a second concurrent
/// session with the same peer fails with [`SyncError::SessionInProgress`].
/// Sessions with different peers run independently.
pub struct Synchronizer {
    db: Arc<Database>,
    config: SyncConfig,
    state_tx: watch::Sender<SyncState>,
    active: DashMap<String, ()>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Marks a peer as busy for the lifetime of one session.
struct SessionGuard<'a> {
    active: &'a DashMap<String, ()>,
    peer: String,
}

impl<'a> SessionGuard<'a> {
    fn acquire(active: &'a DashMap<String, ()>, peer: &str) -> Result<Self, SyncError> {
        match active.entry(peer.to_string()) {
            Entry::Occupied(_) => Err(SyncError::SessionInProgress(peer.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Self {
                    active,
                    peer: peer.to_string(),
                })
            }
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.peer);
    }
}

/// Resolves once `rx` carries `true`; never resolves without a receiver
/// or after the sender is gone.
async fn cancelled(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

impl Synchronizer {
    pub fn new(db: Arc<Database>, config: SyncConfig) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        Self {
            db,
            config,
            state_tx,
            active: DashMap::new(),
            cancel: None,
        }
    }

    /// Abort running and future sessions once `cancel` becomes `true`.
    #[must_use]
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// State of the most recently advanced session.
    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        debug!(state = %state, "Sync state");
        self.state_tx.send_replace(state);
    }

    /// Run one session against `target`, bounded by the session timeout and
    /// the cancel signal. Nothing is checkpointed unless the session reaches
    /// the checkpoint step.
    #[instrument(skip(self, target), fields(replica = %self.db.replica_uid()))]
    pub async fn sync(&self, target: &dyn SyncTarget) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let timeout = self.config.session_timeout();

        let outcome = tokio::select! {
            biased;
            () = cancelled(self.cancel.clone()) => Err(SyncError::Cancelled),
            res = tokio::time::timeout(timeout, self.run_session(target)) => {
                res.unwrap_or(Err(SyncError::Timeout(timeout)))
            }
        };

        crate::metrics::record_sync_duration(start.elapsed());
        match &outcome {
            Ok(report) => {
                self.set_state(SyncState::Done);
                crate::metrics::record_sync_session(if report.early_exit { "noop" } else { "success" });
                info!(
                    peer = %report.target_replica_uid,
                    sent = report.sent,
                    received = report.received,
                    applied = report.applied,
                    conflicts = report.conflicts,
                    "Sync session complete"
                );
            }
            Err(e) => {
                self.set_state(SyncState::Failed);
                crate::metrics::record_sync_session(e.kind());
                error!(error = %e, "Sync session failed");
            }
        }
        outcome
    }

    /// [`sync`](Self::sync), restarting the whole session on retryable
    /// failures with the configured backoff.
    pub async fn sync_with_retry(&self, target: &dyn SyncTarget) -> Result<SyncReport, SyncError> {
        let config = self.config.retry_config();
        retry_if("sync_session", &config, || self.sync(target), SyncError::is_retryable).await
    }

    /// One session per target, run concurrently. Results are in target order.
    pub async fn sync_all(&self, targets: &[Arc<dyn SyncTarget>]) -> Vec<Result<SyncReport, SyncError>> {
        join_all(targets.iter().map(|target| self.sync_with_retry(target.as_ref()))).await
    }

    async fn run_session(&self, target: &dyn SyncTarget) -> Result<SyncReport, SyncError> {
        let db = &self.db;
        let uid = db.replica_uid().to_string();

        self.set_state(SyncState::Init);
        let info = target.get_sync_info(&uid).await?;
        let peer = info.target_replica_uid.clone();
        if peer == uid {
            return Err(SyncError::SameReplica(uid));
        }
        let _guard = SessionGuard::acquire(&self.active, &peer)?;
        info!(peer = %peer, "Sync session started");

        self.set_state(SyncState::ExchangeInfo);
        validate_claim(db, &info.source_checkpoint).await?;
        let known_target = db.backend().checkpoint(&peer).await?.unwrap_or_default();
        if info.target_generation.generation < known_target.generation {
            return Err(SyncError::InvalidGeneration {
                replica: peer,
                claimed: info.target_generation.generation,
                known: known_target.generation,
            });
        }
        if info.target_generation.generation == known_target.generation
            && known_target.generation > 0
            && known_target.transaction_id.is_some()
            && info.target_generation.transaction_id != known_target.transaction_id
        {
            return Err(SyncError::InvalidTransactionId {
                replica: peer,
                generation: known_target.generation,
            });
        }

        let local = db.backend().generation().await?;
        let mut report = SyncReport {
            source_replica_uid: uid.clone(),
            target_replica_uid: peer.clone(),
            source_generation: local.generation,
            target_generation: known_target.generation,
            ..Default::default()
        };
        if local.generation == info.source_checkpoint.generation
            && info.target_generation.generation == known_target.generation
        {
            debug!(peer = %peer, generation = local.generation, "Nothing to sync");
            report.early_exit = true;
            return Ok(report);
        }

        self.set_state(SyncState::TransferRecords);
        let records = collect_changes(db, info.source_checkpoint.generation, local.generation, &HashSet::new()).await?;
        report.sent = records.len();
        crate::metrics::record_sync_records("sent", records.len());

        let response = target
            .sync_exchange(ExchangeRequest {
                source_replica_uid: uid.clone(),
                records,
                last_known_target: known_target,
                source_generation: local.clone(),
            })
            .await?;
        report.received = response.records.len();
        report.target_generation = response.target_generation.generation;
        report.target_rejected = response.rejected;
        crate::metrics::record_sync_records("received", response.records.len());

        self.set_state(SyncState::Apply);
        let before_apply = db.backend().generation().await?.generation;
        let snapshot = if self.config.resolve_to_source {
            self.snapshot_contents(response.records.iter().map(|r| r.doc_id.as_str())).await?
        } else {
            HashMap::new()
        };

        let batch = apply_records(db, &response.records).await?;
        let committed = batch.changed();
        let conflicted: BTreeSet<String> = batch.conflicted().map(str::to_string).collect();
        report.applied = committed;
        report.conflicts = conflicted.len();
        report.skipped = batch.skipped;

        if self.config.resolve_to_source {
            report.resolved = self.resolve_in_favour_of_source(&conflicted, &snapshot).await?;
        }

        self.set_state(SyncState::Checkpoint);
        db.raise_checkpoint(&peer, &response.target_generation).await?;

        // The target already holds everything up to `local`; if the only
        // commits since are the ones the apply made, it holds those too.
        let after = db.backend().generation().await?;
        if committed > 0
            && before_apply == local.generation
            && after.generation == before_apply + committed as u64
        {
            match target.record_sync_info(&uid, after.clone()).await {
                Ok(()) => report.recorded_sync_info = true,
                Err(e) => warn!(peer = %peer, error = %e, "record_sync_info failed"),
            }
        }

        Ok(report)
    }

    /// Current content of each already known document, `None` for tombstones.
    async fn snapshot_contents<'a>(
        &self,
        doc_ids: impl Iterator<Item = &'a str>,
    ) -> Result<HashMap<String, Option<Value>>, DbError> {
        let mut snapshot = HashMap::new();
        for doc_id in doc_ids {
            if snapshot.contains_key(doc_id) {
                continue;
            }
            if let Some(state) = self.db.document_state(doc_id).await? {
                snapshot.insert(doc_id.to_string(), state.current().content.clone());
            }
        }
        Ok(snapshot)
    }

    async fn resolve_in_favour_of_source(
        &self,
        conflicted: &BTreeSet<String>,
        snapshot: &HashMap<String, Option<Value>>,
    ) -> Result<usize, DbError> {
        let mut resolved = 0;
        for doc_id in conflicted {
            let Some(content) = snapshot.get(doc_id) else {
                continue;
            };
            let Some(state) = self.db.document_state(doc_id).await? else {
                continue;
            };
            let heads: Vec<Revision> = state.heads().iter().map(|h| h.revision.clone()).collect();
            match self.db.resolve_conflicts(doc_id, content.clone(), &heads).await {
                Ok(revision) => {
                    debug!(doc_id = %doc_id, revision = %revision, "Resolved conflict to source");
                    resolved += 1;
                }
                Err(e @ (DbError::ConflictMismatch { .. } | DbError::NotFound(_))) => {
                    warn!(doc_id = %doc_id, error = %e, "Conflict changed during resolve, leaving it");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }
}
