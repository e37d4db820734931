//! In-process sync target.

use std::sync::Arc;

use async_trait::async_trait;

use super::target::{ExchangeRequest, ExchangeResponse, SyncInfo, SyncTarget};
use crate::error::{DbError, SyncError, TransportError};
use crate::storage::traits::Checkpoint;
use crate::store::Database;

/// Sync target backed by another [`Database`] in the same process.
///
/// Used for local-to-local sync (e.g. a scratch copy and a main database)
/// and as the reference transport in tests.
#[derive(Clone)]
pub struct LocalTarget {
    db: Arc<Database>,
}

impl LocalTarget {
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

/// Target-side failures look like remote failures to the source.
fn to_transport(err: SyncError) -> TransportError {
    match err {
        SyncError::Transport(e) => e,
        SyncError::Db(DbError::Storage(e)) => TransportError::Remote(e.to_string()),
        other => TransportError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl SyncTarget for LocalTarget {
    async fn get_sync_info(&self, source_replica_uid: &str) -> Result<SyncInfo, TransportError> {
        self.db.serve_sync_info(source_replica_uid).await.map_err(to_transport)
    }

    async fn sync_exchange(&self, request: ExchangeRequest) -> Result<ExchangeResponse, TransportError> {
        self.db.serve_sync_exchange(request).await.map_err(to_transport)
    }

    async fn record_sync_info(&self, source_replica_uid: &str, checkpoint: Checkpoint) -> Result<(), TransportError> {
        self.db
            .serve_record_sync_info(source_replica_uid, checkpoint)
            .await
            .map_err(to_transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::StorageError;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_transport(SyncError::Db(DbError::Storage(StorageError::Backend("io".into())))),
            TransportError::Remote(_)
        ));
        assert!(matches!(
            to_transport(SyncError::SameReplica("x".into())),
            TransportError::Rejected(_)
        ));
        assert!(matches!(
            to_transport(SyncError::Transport(TransportError::Unavailable("x".into()))),
            TransportError::Unavailable(_)
        ));
    }
}
