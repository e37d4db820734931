// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite backend for durable replicas.
//!
//! Schema:
//! ```sql
//! CREATE TABLE replica_config (name TEXT PRIMARY KEY, value TEXT NOT NULL);
//! CREATE TABLE documents (
//!   doc_id TEXT PRIMARY KEY,
//!   doc_rev TEXT NOT NULL,      -- current revision
//!   content TEXT,               -- JSON text, NULL for tombstones
//!   history TEXT NOT NULL       -- JSON array of ancestor revisions
//! );
//! CREATE TABLE conflicts (
//!   doc_id TEXT NOT NULL, doc_rev TEXT NOT NULL,
//!   content TEXT, history TEXT NOT NULL,
//!   PRIMARY KEY (doc_id, doc_rev)
//! );
//! CREATE TABLE transaction_log (
//!   generation INTEGER PRIMARY KEY,
//!   doc_id TEXT NOT NULL, doc_rev TEXT NOT NULL, transaction_id TEXT NOT NULL
//! );
//! CREATE TABLE sync_checkpoints (
//!   replica_uid TEXT PRIMARY KEY,
//!   known_generation INTEGER NOT NULL, known_transaction_id TEXT
//! );
//! ```
//!
//! The generation counter is `MAX(generation)` of the transaction log, so it
//! survives restarts without a separate counter row. A commit writes the
//! document row, its conflict rows and the log row in one SQL transaction.
//!
//! ## sqlx Any Driver Quirks
//!
//! TEXT columns may come back as BLOB through the `Any` driver, so text is
//! read as `String` first and then as `Vec<u8>`.

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyConnection, AnyPool, Row};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::traits::{Checkpoint, DocumentBackend, StorageError};
use crate::changelog::ChangeRecord;
use crate::document::{DocumentHead, DocumentState};
use crate::resilience::retry::{retry, RetryConfig};
use crate::revision::{Revision, RevisionHistory};

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS replica_config (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS documents (
        doc_id TEXT PRIMARY KEY,
        doc_rev TEXT NOT NULL,
        content TEXT,
        history TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS conflicts (
        doc_id TEXT NOT NULL,
        doc_rev TEXT NOT NULL,
        content TEXT,
        history TEXT NOT NULL,
        PRIMARY KEY (doc_id, doc_rev)
    )",
    "CREATE TABLE IF NOT EXISTS transaction_log (
        generation INTEGER PRIMARY KEY,
        doc_id TEXT NOT NULL,
        doc_rev TEXT NOT NULL,
        transaction_id TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sync_checkpoints (
        replica_uid TEXT PRIMARY KEY,
        known_generation INTEGER NOT NULL,
        known_transaction_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_transaction_log_doc ON transaction_log (doc_id)",
];

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a TEXT column, tolerating drivers that hand it back as bytes.
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

fn required_text(row: &AnyRow, column: &str, id: &str) -> Result<String, StorageError> {
    text_column(row, column).ok_or_else(|| StorageError::Corruption {
        id: id.to_string(),
        reason: format!("missing column '{}'", column),
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Encoded columns of one head.
struct HeadColumns {
    revision: String,
    content: Option<String>,
    history: String,
}

impl HeadColumns {
    fn encode(head: &DocumentHead) -> Result<Self, StorageError> {
        Ok(Self {
            revision: head.revision.to_string(),
            content: head.content.as_ref().map(serde_json::Value::to_string),
            history: serde_json::to_string(&head.history)
                .map_err(|e| StorageError::Backend(format!("encode history: {}", e)))?,
        })
    }

    fn decode(doc_id: &str, row: &AnyRow) -> Result<DocumentHead, StorageError> {
        let corrupt = |reason: String| {
            warn!(doc_id = %doc_id, reason = %reason, "Corrupt document row");
            crate::metrics::record_corruption(doc_id);
            StorageError::Corruption {
                id: doc_id.to_string(),
                reason,
            }
        };

        let revision: Revision = required_text(row, "doc_rev", doc_id)?
            .parse()
            .map_err(|e| corrupt(format!("{}", e)))?;
        let content = match text_column(row, "content") {
            Some(text) => Some(serde_json::from_str(&text).map_err(|e| corrupt(format!("content: {}", e)))?),
            None => None,
        };
        let history: RevisionHistory = serde_json::from_str(&required_text(row, "history", doc_id)?)
            .map_err(|e| corrupt(format!("history: {}", e)))?;

        Ok(DocumentHead { revision, content, history })
    }
}

pub struct SqlBackend {
    pool: AnyPool,
    replica_uid: String,
    // SQLite allows one writer; serializing here avoids SQLITE_BUSY churn
    write_lock: Mutex<()>,
}

impl SqlBackend {
    /// Open (or create) a database at `url`.
    ///
    /// `replica_uid` is only used when the database is new. An existing
    /// database keeps the identity it was created with.
    #[instrument(skip(replica_uid))]
    pub async fn open(url: &str, replica_uid: Option<&str>) -> Result<Self, StorageError> {
        install_drivers();

        // Every connection to `:memory:` is a separate database
        let in_memory = url.contains(":memory:");
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(300)) })
                .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
                .connect(url)
                .await
                .map_err(backend_err)
        })
        .await?;

        if !in_memory {
            Self::enable_wal_mode(&pool).await?;
        }
        Self::init_schema(&pool).await?;
        let replica_uid = Self::load_or_create_uid(&pool, replica_uid).await?;

        info!(replica_uid = %replica_uid, "Opened SQLite document backend");
        Ok(Self {
            pool,
            replica_uid,
            write_lock: Mutex::new(()),
        })
    }

    /// Concurrent readers during writes, single fsync per commit.
    async fn enable_wal_mode(pool: &AnyPool) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(pool: &AnyPool) -> Result<(), StorageError> {
        retry("sql_init_schema", &RetryConfig::startup(), || async {
            for statement in SCHEMA {
                sqlx::query(statement).execute(pool).await.map_err(backend_err)?;
            }
            Ok::<_, StorageError>(())
        })
        .await
    }

    async fn load_or_create_uid(pool: &AnyPool, requested: Option<&str>) -> Result<String, StorageError> {
        let existing = sqlx::query("SELECT value FROM replica_config WHERE name = 'replica_uid'")
            .fetch_optional(pool)
            .await
            .map_err(backend_err)?;

        if let Some(row) = existing {
            let uid = required_text(&row, "value", "replica_config")?;
            if let Some(requested) = requested {
                if requested != uid {
                    warn!(
                        stored = %uid,
                        requested = %requested,
                        "Ignoring replica_uid override for an existing database"
                    );
                }
            }
            return Ok(uid);
        }

        let uid = requested
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        sqlx::query("INSERT INTO replica_config (name, value) VALUES ('replica_uid', ?)")
            .bind(&uid)
            .execute(pool)
            .await
            .map_err(backend_err)?;
        Ok(uid)
    }

    async fn load_conflicts(conn: &mut AnyConnection, doc_id: &str) -> Result<Vec<DocumentHead>, StorageError> {
        let rows = sqlx::query("SELECT doc_rev, content, history FROM conflicts WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_all(conn)
            .await
            .map_err(backend_err)?;
        rows.iter().map(|row| HeadColumns::decode(doc_id, row)).collect()
    }
}

#[async_trait]
impl DocumentBackend for SqlBackend {
    fn replica_uid(&self) -> &str {
        &self.replica_uid
    }

    async fn generation(&self) -> Result<Checkpoint, StorageError> {
        let row = sqlx::query(
            "SELECT generation, transaction_id FROM transaction_log ORDER BY generation DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(match row {
            Some(row) => Checkpoint::new(
                to_u64(row.try_get::<i64, _>("generation").map_err(backend_err)?),
                text_column(&row, "transaction_id"),
            ),
            None => Checkpoint::default(),
        })
    }

    async fn load(&self, doc_id: &str) -> Result<Option<DocumentState>, StorageError> {
        let id = doc_id.to_string();
        retry("sql_load", &RetryConfig::query(), || async {
            // Both tables are read from one snapshot so a concurrent commit
            // is seen entirely or not at all.
            let mut tx = self.pool.begin().await.map_err(backend_err)?;
            let row = sqlx::query("SELECT doc_rev, content, history FROM documents WHERE doc_id = ?")
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend_err)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let mut heads = vec![HeadColumns::decode(&id, &row)?];
            heads.extend(Self::load_conflicts(&mut *tx, &id).await?);
            tx.commit().await.map_err(backend_err)?;
            Ok(DocumentState::from_heads(id.clone(), heads))
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<DocumentState>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let doc_rows = sqlx::query("SELECT doc_id, doc_rev, content, history FROM documents ORDER BY doc_id")
            .fetch_all(&mut *tx)
            .await
            .map_err(backend_err)?;
        let conflict_rows = sqlx::query("SELECT doc_id, doc_rev, content, history FROM conflicts")
            .fetch_all(&mut *tx)
            .await
            .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;

        let mut conflicts: HashMap<String, Vec<DocumentHead>> = HashMap::new();
        for row in &conflict_rows {
            let doc_id = required_text(row, "doc_id", "conflicts")?;
            let head = HeadColumns::decode(&doc_id, row)?;
            conflicts.entry(doc_id).or_default().push(head);
        }

        let mut docs = Vec::with_capacity(doc_rows.len());
        for row in &doc_rows {
            let doc_id = required_text(row, "doc_id", "documents")?;
            let mut heads = vec![HeadColumns::decode(&doc_id, row)?];
            heads.extend(conflicts.remove(&doc_id).unwrap_or_default());
            if let Some(state) = DocumentState::from_heads(doc_id, heads) {
                docs.push(state);
            }
        }
        Ok(docs)
    }

    async fn commit(&self, doc: &DocumentState, transaction_id: &str) -> Result<ChangeRecord, StorageError> {
        let current = HeadColumns::encode(doc.current())?;
        let conflicts = doc
            .conflicts()
            .iter()
            .map(HeadColumns::encode)
            .collect::<Result<Vec<_>, _>>()?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let next: i64 = sqlx::query("SELECT COALESCE(MAX(generation), 0) + 1 AS next FROM transaction_log")
            .fetch_one(&mut *tx)
            .await
            .map_err(backend_err)?
            .try_get("next")
            .map_err(backend_err)?;

        sqlx::query(
            "INSERT INTO documents (doc_id, doc_rev, content, history) VALUES (?, ?, ?, ?) \
             ON CONFLICT(doc_id) DO UPDATE SET \
                doc_rev = excluded.doc_rev, \
                content = excluded.content, \
                history = excluded.history",
        )
        .bind(&doc.doc_id)
        .bind(&current.revision)
        .bind(&current.content)
        .bind(&current.history)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        sqlx::query("DELETE FROM conflicts WHERE doc_id = ?")
            .bind(&doc.doc_id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        for conflict in &conflicts {
            sqlx::query("INSERT INTO conflicts (doc_id, doc_rev, content, history) VALUES (?, ?, ?, ?)")
                .bind(&doc.doc_id)
                .bind(&conflict.revision)
                .bind(&conflict.content)
                .bind(&conflict.history)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }

        sqlx::query("INSERT INTO transaction_log (generation, doc_id, doc_rev, transaction_id) VALUES (?, ?, ?, ?)")
            .bind(next)
            .bind(&doc.doc_id)
            .bind(&current.revision)
            .bind(transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;

        Ok(ChangeRecord {
            generation: to_u64(next),
            doc_id: doc.doc_id.clone(),
            revision: doc.current().revision.clone(),
            transaction_id: transaction_id.to_string(),
        })
    }

    async fn changes_since(&self, generation: u64, limit: usize) -> Result<Vec<ChangeRecord>, StorageError> {
        let rows = retry("sql_changes_since", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT generation, doc_id, doc_rev, transaction_id FROM transaction_log \
                 WHERE generation > ? ORDER BY generation ASC LIMIT ?",
            )
            .bind(to_i64(generation))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)
        })
        .await?;

        rows.iter()
            .map(|row| {
                let generation = to_u64(row.try_get::<i64, _>("generation").map_err(backend_err)?);
                let doc_id = required_text(row, "doc_id", "transaction_log")?;
                let revision = required_text(row, "doc_rev", &doc_id)?
                    .parse()
                    .map_err(|e| StorageError::Corruption {
                        id: doc_id.clone(),
                        reason: format!("{}", e),
                    })?;
                Ok(ChangeRecord {
                    generation,
                    transaction_id: required_text(row, "transaction_id", &doc_id)?,
                    doc_id,
                    revision,
                })
            })
            .collect()
    }

    async fn transaction_id_at(&self, generation: u64) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT transaction_id FROM transaction_log WHERE generation = ?")
            .bind(to_i64(generation))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.and_then(|r| text_column(&r, "transaction_id")))
    }

    async fn checkpoint(&self, peer_uid: &str) -> Result<Option<Checkpoint>, StorageError> {
        let row = sqlx::query(
            "SELECT known_generation, known_transaction_id FROM sync_checkpoints WHERE replica_uid = ?",
        )
        .bind(peer_uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        match row {
            Some(row) => Ok(Some(Checkpoint::new(
                to_u64(row.try_get::<i64, _>("known_generation").map_err(backend_err)?),
                text_column(&row, "known_transaction_id"),
            ))),
            None => Ok(None),
        }
    }

    async fn set_checkpoint(&self, peer_uid: &str, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO sync_checkpoints (replica_uid, known_generation, known_transaction_id) VALUES (?, ?, ?) \
             ON CONFLICT(replica_uid) DO UPDATE SET \
                known_generation = excluded.known_generation, \
                known_transaction_id = excluded.known_transaction_id",
        )
        .bind(peer_uid)
        .bind(to_i64(checkpoint.generation))
        .bind(&checkpoint.transaction_id)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<(String, Checkpoint)>, StorageError> {
        let rows = sqlx::query(
            "SELECT replica_uid, known_generation, known_transaction_id FROM sync_checkpoints ORDER BY replica_uid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.iter()
            .map(|row| {
                let peer = required_text(row, "replica_uid", "sync_checkpoints")?;
                let generation = to_u64(row.try_get::<i64, _>("known_generation").map_err(backend_err)?);
                Ok((peer, Checkpoint::new(generation, text_column(row, "known_transaction_id"))))
            })
            .collect()
    }
}
