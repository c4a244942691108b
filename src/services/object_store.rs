//! Seams between the optimization pipeline and its backing stores.
//!
//! The pipeline only ever sees these traits, so it can run against the SQLite
//! services in production and in-memory fakes in tests.

use crate::models::{
    document::Document,
    object::{ObjectWrite, StoredObject},
};
use crate::services::{
    document_service::{DocumentResult, DocumentService},
    storage_service::{StorageResult, StorageService},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Object store operations used by the optimizer.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool>;

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<StoredObject>;

    async fn download(&self, bucket: &str, key: &str) -> StorageResult<Bytes>;

    /// Write (or overwrite) an object.
    async fn save(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        write: ObjectWrite,
    ) -> StorageResult<StoredObject>;

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<StoredObject>>;

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        expires: DateTime<Utc>,
    ) -> StorageResult<String>;
}

/// Document store operations used by the reference rewrite.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents in `collection` whose top-level `field` equals `value`.
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> DocumentResult<Vec<Document>>;

    /// Merge `fields` into an existing document.
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> DocumentResult<()>;
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        self.object_exists(bucket, key).await
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        self.get_object_metadata(bucket, key).await
    }

    async fn download(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        self.read_object(bucket, key).await
    }

    async fn save(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        write: ObjectWrite,
    ) -> StorageResult<StoredObject> {
        self.put_object(bucket, key, data, write).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<StoredObject>> {
        self.list_objects(bucket, Some(prefix)).await
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        expires: DateTime<Utc>,
    ) -> StorageResult<String> {
        StorageService::signed_url(self, bucket, key, expires).await
    }
}

#[async_trait]
impl DocumentStore for DocumentService {
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> DocumentResult<Vec<Document>> {
        DocumentService::find_by_field(self, collection, field, value).await
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> DocumentResult<()> {
        DocumentService::update_fields(self, collection, id, fields).await
    }
}
