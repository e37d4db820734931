// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host application binding.
//!
//! [`DocumentApi`] is the narrow capability set a host (UI layer, REST
//! adapter, scripting bridge) works through: create, read, update, delete,
//! enumerate. It speaks [`Document`] values that carry their own revision,
//! so the CAS check is implicit in passing back the document you read.
//!
//! # Example
//!
//! ```rust
//! use docsync::{Database, DatabaseConfig, DocumentApi};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let db = Database::open(DatabaseConfig::default()).await.unwrap();
//!
//! let mut doc = db.create_doc(json!({"title": "groceries"}), None).await.unwrap();
//! assert!(doc.doc_id.starts_with("D-"));
//!
//! doc.set_content(json!({"title": "groceries", "items": ["milk"]}));
//! let doc = db.put_doc(&doc).await.unwrap();
//! assert_eq!(doc.revision.as_ref().unwrap().generation(), 2);
//!
//! db.delete_doc(&doc).await.unwrap();
//! assert!(db.get_doc(&doc.doc_id, false).await.unwrap().is_none());
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::document::Document;
use crate::error::DbError;
use crate::revision::Revision;
use crate::store::Database;

/// CRUD + enumerate over documents.
#[async_trait]
pub trait DocumentApi: Send + Sync {
    /// Store a new document. A `D-<uuid>` id is generated when none is given.
    async fn create_doc(&self, content: Value, doc_id: Option<&str>) -> Result<Document, DbError>;

    /// Write `doc.content` on top of `doc.revision`.
    async fn put_doc(&self, doc: &Document) -> Result<Document, DbError>;

    /// Tombstone the document at `doc.revision`, returning the tombstone.
    async fn delete_doc(&self, doc: &Document) -> Result<Document, DbError>;

    /// `None` for unknown ids, and for tombstones unless `include_deleted`.
    async fn get_doc(&self, doc_id: &str, include_deleted: bool) -> Result<Option<Document>, DbError>;

    async fn get_all_docs(&self, include_deleted: bool) -> Result<Vec<Document>, DbError>;

    /// The current version followed by every conflicting version, or an
    /// empty list when the document is not in conflict.
    async fn get_doc_conflicts(&self, doc_id: &str) -> Result<Vec<Document>, DbError>;
}

fn new_doc_id() -> String {
    format!("D-{}", uuid::Uuid::new_v4().simple())
}

/// A local write absorbs every head, so the written revision has no conflicts.
fn written(doc_id: String, revision: Revision, content: Option<Value>) -> Document {
    Document {
        doc_id,
        revision: Some(revision),
        content,
        conflicts: Vec::new(),
    }
}

#[async_trait]
impl DocumentApi for Database {
    async fn create_doc(&self, content: Value, doc_id: Option<&str>) -> Result<Document, DbError> {
        let doc_id = doc_id.map_or_else(new_doc_id, str::to_string);
        let revision = self.put(&doc_id, content.clone(), None).await?;
        Ok(written(doc_id, revision, Some(content)))
    }

    async fn put_doc(&self, doc: &Document) -> Result<Document, DbError> {
        let content = doc.content.clone().ok_or_else(|| DbError::InvalidContent {
            doc_id: doc.doc_id.clone(),
            reason: "cannot put a tombstone, use delete_doc".to_string(),
        })?;
        let revision = self.put(&doc.doc_id, content.clone(), doc.revision.as_ref()).await?;
        Ok(written(doc.doc_id.clone(), revision, Some(content)))
    }

    async fn delete_doc(&self, doc: &Document) -> Result<Document, DbError> {
        let expected = doc.revision.as_ref().ok_or_else(|| DbError::NotFound(doc.doc_id.clone()))?;
        let revision = self.delete(&doc.doc_id, expected).await?;
        Ok(written(doc.doc_id.clone(), revision, None))
    }

    async fn get_doc(&self, doc_id: &str, include_deleted: bool) -> Result<Option<Document>, DbError> {
        match self.get(doc_id).await {
            Ok(doc) if doc.is_tombstone() && !include_deleted => Ok(None),
            Ok(doc) => Ok(Some(doc)),
            Err(DbError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_all_docs(&self, include_deleted: bool) -> Result<Vec<Document>, DbError> {
        let mut docs = self.all_documents().await?;
        if !include_deleted {
            docs.retain(|d| !d.is_tombstone());
        }
        Ok(docs)
    }

    async fn get_doc_conflicts(&self, doc_id: &str) -> Result<Vec<Document>, DbError> {
        let Some(state) = self.document_state(doc_id).await? else {
            return Ok(Vec::new());
        };
        if !state.has_conflicts() {
            return Ok(Vec::new());
        }
        Ok(state
            .heads()
            .iter()
            .map(|head| Document {
                doc_id: doc_id.to_string(),
                revision: Some(head.revision.clone()),
                content: head.content.clone(),
                conflicts: Vec::new(),
            })
            .collect())
    }
}
