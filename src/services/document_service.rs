//! DocumentService: JSON documents grouped in named collections, stored in
//! SQLite. Holds the trip, agency and user records that point at images.

use crate::models::document::Document;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document `{collection}/{id}` not found")]
    NotFound { collection: String, id: String },
    #[error("invalid identifier `{0}`")]
    InvalidName(String),
    #[error("stored document is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

#[derive(FromRow)]
struct DocumentRow {
    collection: String,
    id: String,
    data: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = DocumentError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Document {
            collection: row.collection,
            id: row.id,
            data: serde_json::from_str(&row.data)?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct DocumentService {
    pub db: Arc<SqlitePool>,
}

/// Collection, document id and field names: ASCII letters, digits, `_` and `-`.
fn ensure_name_safe(name: &str) -> DocumentResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(DocumentError::InvalidName(name.to_string()))
    }
}

impl DocumentService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert or replace a whole document.
    pub async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> DocumentResult<Document> {
        ensure_name_safe(collection)?;
        ensure_name_safe(id)?;
        let updated_at = Utc::now();
        sqlx::query(
            "INSERT INTO documents (collection, id, data, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
        )
        .bind(collection)
        .bind(id)
        .bind(serde_json::to_string(&data)?)
        .bind(updated_at)
        .execute(&*self.db)
        .await?;

        Ok(Document {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
            updated_at,
        })
    }

    pub async fn get(&self, collection: &str, id: &str) -> DocumentResult<Document> {
        ensure_name_safe(collection)?;
        ensure_name_safe(id)?;
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT collection, id, data, updated_at FROM documents
             WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| DocumentError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        row.try_into()
    }

    /// Documents whose top-level `field` is the string `value`.
    pub async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> DocumentResult<Vec<Document>> {
        ensure_name_safe(collection)?;
        ensure_name_safe(field)?;
        let path = format!("$.\"{}\"", field);
        let rows = sqlx::query_as::<_, DocumentRow>(
            "SELECT collection, id, data, updated_at FROM documents
             WHERE collection = ? AND json_extract(data, ?) = ?
             ORDER BY id ASC",
        )
        .bind(collection)
        .bind(path)
        .bind(value)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter().map(Document::try_from).collect()
    }

    /// Set `fields` on the document's top level in one statement, leaving
    /// every other field as it was. The document must exist.
    ///
    /// One statement, no read-then-write: concurrent updates queue on the
    /// connection's busy timeout.
    pub async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> DocumentResult<()> {
        ensure_name_safe(collection)?;
        ensure_name_safe(id)?;

        let mut assignments = Vec::with_capacity(fields.len());
        for (field, value) in &fields {
            ensure_name_safe(field)?;
            assignments.push((format!("$.\"{}\"", field), serde_json::to_string(value)?));
        }

        let sql = format!(
            "UPDATE documents SET data = json_set(data{}), updated_at = ?
             WHERE collection = ? AND id = ?",
            ", ?, json(?)".repeat(assignments.len())
        );
        let mut query = sqlx::query(&sql);
        for (path, value) in assignments {
            query = query.bind(path).bind(value);
        }
        let result = query
            .bind(Utc::now())
            .bind(collection)
            .bind(id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DocumentError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        debug!(collection, id, "document updated");
        Ok(())
    }
}
