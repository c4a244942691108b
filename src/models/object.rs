//! Represents an object (blob) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::metadata::MetadataMap;

/// Represents a single object within a bucket.
///
/// The `Object` struct stores the object's record, not its content bytes.
/// Custom key-value metadata lives in a separate table and travels with
/// [`StoredObject`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload.
    pub etag: Option<String>,

    /// Whether the object may be read without a signed URL.
    pub is_public: bool,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,

    /// Soft-delete marker.
    pub is_deleted: bool,
}

impl Object {
    /// True when the recorded content type is an `image/*` type.
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

/// An object record together with its custom metadata.
#[derive(Serialize, Clone, Debug)]
pub struct StoredObject {
    #[serde(flatten)]
    pub object: Object,
    pub metadata: MetadataMap,
}

/// Attributes applied when writing an object.
#[derive(Clone, Debug, Default)]
pub struct ObjectWrite {
    pub content_type: Option<String>,
    pub metadata: MetadataMap,
    pub public: bool,
}

impl ObjectWrite {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }
}
