//! JSON documents that reference stored objects (trips, agencies, users).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document in a named collection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub data: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// String value of a top-level field, if present and a string.
    pub fn field_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }
}

/// A collection whose documents hold an object path in `path_field` and a
/// download URL for it in `url_field`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceTarget {
    pub collection: &'static str,
    pub path_field: &'static str,
    pub url_field: &'static str,
}

/// Field stamped on every rewritten document.
pub const OPTIMIZED_AT_FIELD: &str = "optimizedAt";

/// Every collection that can point at an uploaded image.
pub static REFERENCE_TARGETS: [ReferenceTarget; 3] = [
    ReferenceTarget {
        collection: "trips",
        path_field: "image",
        url_field: "imageUrl",
    },
    ReferenceTarget {
        collection: "agencies",
        path_field: "logo",
        url_field: "logoUrl",
    },
    ReferenceTarget {
        collection: "users",
        path_field: "photo_url",
        url_field: "photoUrl",
    },
];
