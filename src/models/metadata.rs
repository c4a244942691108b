//! Custom metadata attached to objects.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Ordered key-value map of an object's custom metadata.
pub type MetadataMap = BTreeMap<String, String>;

/// One metadata row as stored in SQLite.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectMetadata {
    /// Reference to the associated object.
    pub object_id: Uuid,

    /// Metadata key (e.g. `originalFile`).
    pub key: String,

    /// Metadata value as plain text.
    pub value: String,
}

/// Provenance keys written on every optimized derivative.
pub mod keys {
    pub const ORIGINAL_FILE: &str = "originalFile";
    pub const OPTIMIZED_BY: &str = "optimizedBy";
    pub const ORIGINAL_SIZE: &str = "originalSize";
    pub const OPTIMIZED_SIZE: &str = "optimizedSize";
    pub const COMPRESSION_RATIO: &str = "compressionRatio";
    pub const ORIGINAL_DIMENSIONS: &str = "originalDimensions";
    pub const OPTIMIZED_DIMENSIONS: &str = "optimizedDimensions";
    pub const OPTIMIZED_AT: &str = "optimizedAt";
}
