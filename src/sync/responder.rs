// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target side of the sync protocol.
//!
//! These are the handlers a transport calls when this database is the
//! *target* of someone else's session. [`LocalTarget`](super::LocalTarget)
//! calls them directly.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::target::{ExchangeRecord, ExchangeRequest, ExchangeResponse, SkippedRecord, SyncInfo};
use crate::changelog::ChangeFeed;
use crate::error::{DbError, SyncError};
use crate::revision::Revision;
use crate::storage::traits::Checkpoint;
use crate::store::{ApplyOutcome, Database};

/// Outcome of applying a batch of incoming records.
#[derive(Debug, Default)]
pub(crate) struct AppliedBatch {
    /// (doc_id, revision) of every record that was accepted or already known
    pub received: HashSet<(String, Revision)>,
    pub outcomes: Vec<(String, ApplyOutcome)>,
    pub skipped: Vec<SkippedRecord>,
}

impl AppliedBatch {
    pub fn changed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.changed()).count()
    }

    pub fn conflicted(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == ApplyOutcome::Conflicted)
            .map(|(id, _)| id.as_str())
    }
}

/// Apply every record, skipping the ones with invalid ids or content.
/// Storage failures abort the batch.
pub(crate) async fn apply_records(db: &Database, records: &[ExchangeRecord]) -> Result<AppliedBatch, DbError> {
    let mut batch = AppliedBatch::default();
    for record in records {
        let applied = match record.to_head() {
            Ok(head) => db.apply_remote(&record.doc_id, head).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(outcome) => {
                batch.received.insert((record.doc_id.clone(), record.revision.clone()));
                batch.outcomes.push((record.doc_id.clone(), outcome));
            }
            Err(e @ (DbError::InvalidContent { .. } | DbError::InvalidDocId(_))) => {
                warn!(doc_id = %record.doc_id, revision = %record.revision, error = %e, "Skipping invalid sync record");
                crate::metrics::record_sync_records("skipped", 1);
                batch.skipped.push(SkippedRecord {
                    doc_id: record.doc_id.clone(),
                    revision: record.revision.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(batch)
}

/// Heads of every document changed in `(after, upper]`, skipping heads in
/// `exclude`. One entry per head, ordered by the document's latest change.
pub(crate) async fn collect_changes(
    db: &Database,
    after: u64,
    upper: u64,
    exclude: &HashSet<(String, Revision)>,
) -> Result<Vec<ExchangeRecord>, DbError> {
    let mut feed = ChangeFeed::new(db.backend().clone(), after, upper, db.config().change_page_size);

    // Latest change per document, in log order
    let mut latest: HashMap<String, (u64, String)> = HashMap::new();
    while let Some(change) = feed.next().await? {
        latest.insert(change.doc_id, (change.generation, change.transaction_id));
    }
    let mut ordered: Vec<(String, u64, String)> = latest
        .into_iter()
        .map(|(doc_id, (generation, tx))| (doc_id, generation, tx))
        .collect();
    ordered.sort_by_key(|(_, generation, _)| *generation);

    let mut records = Vec::new();
    for (doc_id, generation, transaction_id) in ordered {
        let Some(state) = db.document_state(&doc_id).await? else {
            continue;
        };
        records.extend(
            ExchangeRecord::from_state(&state, generation, &transaction_id)
                .into_iter()
                .filter(|r| !exclude.contains(&(r.doc_id.clone(), r.revision.clone()))),
        );
    }
    Ok(records)
}

/// Check a peer's claim about this replica's log: the generation must exist
/// here and carry the same transaction id.
pub(crate) async fn validate_claim(db: &Database, claim: &Checkpoint) -> Result<(), SyncError> {
    let own = db.backend().generation().await?;
    if claim.generation > own.generation {
        return Err(SyncError::InvalidGeneration {
            replica: db.replica_uid().to_string(),
            claimed: claim.generation,
            known: own.generation,
        });
    }
    if claim.generation == 0 {
        return Ok(());
    }
    if let Some(claimed_tx) = &claim.transaction_id {
        let actual = db.backend().transaction_id_at(claim.generation).await?;
        if actual.as_deref() != Some(claimed_tx.as_str()) {
            return Err(SyncError::InvalidTransactionId {
                replica: db.replica_uid().to_string(),
                generation: claim.generation,
            });
        }
    }
    Ok(())
}

impl Database {
    /// Checkpoint of `peer_uid` if higher than the stored one.
    pub(crate) async fn raise_checkpoint(&self, peer_uid: &str, checkpoint: &Checkpoint) -> Result<(), DbError> {
        let known = self.backend().checkpoint(peer_uid).await?.unwrap_or_default();
        if checkpoint.generation > known.generation {
            self.backend().set_checkpoint(peer_uid, checkpoint).await?;
        }
        Ok(())
    }

    /// `get_sync_info` as seen from the target. A source with this replica's
    /// uid is answered too; the source rejects the session on seeing its own
    /// uid come back.
    pub async fn serve_sync_info(&self, source_replica_uid: &str) -> Result<SyncInfo, SyncError> {
        Ok(SyncInfo {
            target_replica_uid: self.replica_uid().to_string(),
            target_generation: self.backend().generation().await?,
            source_checkpoint: self
                .backend()
                .checkpoint(source_replica_uid)
                .await?
                .unwrap_or_default(),
        })
    }

    /// `sync_exchange` as seen from the target: apply the source's records,
    /// then answer with this replica's changes since the source's checkpoint,
    /// minus what the source just sent.
    pub async fn serve_sync_exchange(&self, request: ExchangeRequest) -> Result<ExchangeResponse, SyncError> {
        let source = request.source_replica_uid.as_str();
        if source == self.replica_uid() {
            return Err(SyncError::SameReplica(source.to_string()));
        }
        validate_claim(self, &request.last_known_target).await?;

        let known = self.backend().checkpoint(source).await?.unwrap_or_default();
        if request.source_generation.generation < known.generation {
            // Source lost history since the last sync (e.g. restored from backup)
            return Err(SyncError::InvalidGeneration {
                replica: source.to_string(),
                claimed: request.source_generation.generation,
                known: known.generation,
            });
        }

        let batch = apply_records(self, &request.records).await?;
        crate::metrics::record_sync_records("received", request.records.len());

        let target_generation = self.backend().generation().await?;
        let records = collect_changes(
            self,
            request.last_known_target.generation,
            target_generation.generation,
            &batch.received,
        )
        .await?;

        // Every source record has been applied or skipped as invalid
        self.raise_checkpoint(source, &request.source_generation).await?;

        debug!(
            source = %source,
            received = request.records.len(),
            applied = batch.changed(),
            returned = records.len(),
            "Served sync exchange"
        );
        crate::metrics::record_sync_records("sent", records.len());

        Ok(ExchangeResponse {
            records,
            target_generation,
            rejected: batch.skipped,
        })
    }

    /// `record_sync_info` as seen from the target.
    pub async fn serve_record_sync_info(&self, source_replica_uid: &str, checkpoint: Checkpoint) -> Result<(), SyncError> {
        if source_replica_uid == self.replica_uid() {
            return Err(SyncError::SameReplica(source_replica_uid.to_string()));
        }
        self.raise_checkpoint(source_replica_uid, &checkpoint).await?;
        info!(source = %source_replica_uid, generation = checkpoint.generation, "Recorded source checkpoint");
        Ok(())
    }
}
