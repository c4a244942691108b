//! Represents a logical bucket, the top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket. The default bucket is created at startup so upload
/// triggers always have somewhere to land.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    pub id: Uuid,

    /// Globally unique bucket name (DNS-style naming rules).
    pub name: String,

    /// User that created the bucket; `None` for buckets the service made itself.
    pub created_by: Option<String>,

    /// Region label (e.g. "local").
    pub region: String,

    pub created_at: DateTime<Utc>,
}
