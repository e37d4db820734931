// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change log records and the lazy change feed.
//!
//! Every successful mutation appends one [`ChangeRecord`] with the next value
//! of the replica's generation counter. [`ChangeFeed`] walks the log from any
//! generation offset, one page at a time, so large logs are never loaded at
//! once and an interrupted walk resumes from [`ChangeFeed::position`].

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::revision::Revision;
use crate::storage::traits::{DocumentBackend, StorageError};

/// One entry of a replica's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Replica-local, strictly increasing, never reused
    pub generation: u64,
    pub doc_id: String,
    /// Current revision of the document after the mutation
    pub revision: Revision,
    /// Opaque id, `T-<uuid>`
    pub transaction_id: String,
}

/// New transaction id for a change record.
#[must_use]
pub fn new_transaction_id() -> String {
    format!("T-{}", uuid::Uuid::new_v4().simple())
}

/// Lazy, finite, restartable walk over change records after a generation.
///
/// The feed stops at the generation that was current when it was created,
/// so concurrent writers cannot make it run forever.
pub struct ChangeFeed {
    backend: Arc<dyn DocumentBackend>,
    position: u64,
    upper_bound: u64,
    page_size: usize,
    buffer: VecDeque<ChangeRecord>,
    exhausted: bool,
}

impl ChangeFeed {
    pub(crate) fn new(
        backend: Arc<dyn DocumentBackend>,
        after_generation: u64,
        upper_bound: u64,
        page_size: usize,
    ) -> Self {
        Self {
            backend,
            position: after_generation,
            upper_bound,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: after_generation >= upper_bound,
        }
    }

    /// Generation of the last record handed out (or the starting offset).
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Last generation this feed will yield.
    #[must_use]
    pub fn upper_bound(&self) -> u64 {
        self.upper_bound
    }

    /// Next record, fetching a page from the backend when the buffer is empty.
    pub async fn next(&mut self) -> Result<Option<ChangeRecord>, StorageError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        match self.buffer.pop_front() {
            Some(record) => {
                self.position = record.generation;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Drain the remaining records into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<ChangeRecord>, StorageError> {
        let mut all = Vec::new();
        while let Some(record) = self.next().await? {
            all.push(record);
        }
        Ok(all)
    }

    /// Adapt into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeRecord, StorageError>> {
        stream::try_unfold(self, |mut feed| async move {
            let next = feed.next().await?;
            Ok::<_, StorageError>(next.map(|record| (record, feed)))
        })
    }

    async fn fill(&mut self) -> Result<(), StorageError> {
        let after = self.buffer.back().map_or(self.position, |r| r.generation);
        let page = self.backend.changes_since(after, self.page_size).await?;
        let fetched = page.len();

        for record in page {
            if record.generation > self.upper_bound {
                self.exhausted = true;
                break;
            }
            self.buffer.push_back(record);
        }

        if fetched < self.page_size {
            self.exhausted = true;
        }
        if self.buffer.back().is_some_and(|r| r.generation >= self.upper_bound) {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentHead, DocumentState};
    use crate::revision::{new_revision, RevisionHistory};
    use crate::storage::memory::MemoryBackend;
    use futures::TryStreamExt;
    use serde_json::json;

    async fn backend_with(n: usize) -> Arc<dyn DocumentBackend> {
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new("replica-test"));
        for i in 0..n {
            let content = json!({"i": i});
            let state = DocumentState::new(
                format!("doc-{}", i),
                DocumentHead {
                    revision: new_revision(None, "replica-test", Some(&content)),
                    content: Some(content),
                    history: RevisionHistory::new(),
                },
            );
            backend.commit(&state, &new_transaction_id()).await.unwrap();
        }
        backend
    }

    #[test]
    fn test_transaction_id_format() {
        let id = new_transaction_id();
        assert!(id.starts_with("T-"));
        assert_eq!(id.len(), 34);
        assert_ne!(id, new_transaction_id());
    }

    #[tokio::test]
    async fn test_feed_pages_through_everything() {
        let backend = backend_with(7).await;
        let feed = ChangeFeed::new(backend, 0, 7, 3);
        let records = feed.collect_all().await.unwrap();
        let gens: Vec<u64> = records.iter().map(|r| r.generation).collect();
        assert_eq!(gens, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_feed_restarts_from_offset() {
        let backend = backend_with(5).await;
        let mut feed = ChangeFeed::new(backend.clone(), 0, 5, 2);
        feed.next().await.unwrap();
        feed.next().await.unwrap();
        assert_eq!(feed.position(), 2);

        let resumed = ChangeFeed::new(backend, feed.position(), 5, 2);
        let rest: Vec<u64> = resumed
            .collect_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.generation)
            .collect();
        assert_eq!(rest, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_feed_respects_upper_bound() {
        let backend = backend_with(6).await;
        let records = ChangeFeed::new(backend, 1, 4, 10).collect_all().await.unwrap();
        let gens: Vec<u64> = records.iter().map(|r| r.generation).collect();
        assert_eq!(gens, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_feed_empty_when_caught_up() {
        let backend = backend_with(3).await;
        let mut feed = ChangeFeed::new(backend, 3, 3, 10);
        assert!(feed.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feed_as_stream() {
        let backend = backend_with(4).await;
        let records: Vec<ChangeRecord> = ChangeFeed::new(backend, 0, 4, 3)
            .into_stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].doc_id, "doc-0");
    }
}
