//! In-memory stand-ins for the object store, document store and network.

use crate::cache_controller::{CacheError, CacheMode, FetchRequest, FetchResponse, Network};
use crate::models::{
    document::Document,
    metadata::MetadataMap,
    object::{Object, ObjectWrite, StoredObject},
};
use crate::services::{
    document_service::{DocumentError, DocumentResult},
    object_store::{DocumentStore, ObjectStore},
    storage_service::{StorageError, StorageResult},
};
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    future::Future,
    io::Cursor,
    time::Duration,
};
use tokio::sync::Mutex;
use url::Url;
use uuid::Uuid;

/// A PNG of the given size with a simple gradient.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, 128])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode test png");
    buf.into_inner()
}

/// Poll `check` until it holds or roughly a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), (StoredObject, Bytes)>>,
}

impl MemoryObjectStore {
    pub async fn insert_with(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: Vec<u8>,
        public: bool,
    ) {
        let write = ObjectWrite {
            public,
            ..ObjectWrite::with_content_type(content_type)
        };
        self.store(bucket, key, Bytes::from(data), write).await;
    }

    pub async fn insert_meta(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: Vec<u8>,
        metadata: MetadataMap,
    ) {
        let write = ObjectWrite {
            metadata,
            ..ObjectWrite::with_content_type(content_type)
        };
        self.store(bucket, key, Bytes::from(data), write).await;
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(stored, _)| stored.clone())
    }

    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    async fn store(&self, bucket: &str, key: &str, data: Bytes, write: ObjectWrite) -> StoredObject {
        let object = Object {
            id: Uuid::new_v4(),
            bucket_id: Uuid::nil(),
            key: key.to_string(),
            filename: key.rsplit('/').next().unwrap_or(key).to_string(),
            content_type: write.content_type,
            size_bytes: data.len() as i64,
            etag: Some(format!("{:x}", md5::compute(&data))),
            is_public: write.public,
            last_modified: Utc::now(),
            is_deleted: false,
        };
        let stored = StoredObject {
            object,
            metadata: write.metadata,
        };
        self.objects
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), (stored.clone(), data));
        stored
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        Ok(self.get(bucket, key).await.is_some())
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        self.get(bucket, key)
            .await
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn download(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(_, data)| data.clone())
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn save(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        write: ObjectWrite,
    ) -> StorageResult<StoredObject> {
        Ok(self.store(bucket, key, data, write).await)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<StoredObject>> {
        Ok(self
            .objects
            .lock()
            .await
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|(_, (stored, _))| stored.clone())
            .collect())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        expires: DateTime<Utc>,
    ) -> StorageResult<String> {
        self.head(bucket, key).await?;
        Ok(format!(
            "memory://{}/{}?expires={}",
            bucket,
            key,
            expires.timestamp()
        ))
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<(String, String), Map<String, Value>>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryDocumentStore {
    pub async fn insert(&self, collection: &str, id: &str, data: Value) {
        let Value::Object(data) = data else {
            panic!("documents must be JSON objects");
        };
        self.documents
            .lock()
            .await
            .insert((collection.to_string(), id.to_string()), data);
    }

    pub async fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.documents
            .lock()
            .await
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
            .map(Value::Object)
    }

    /// Make every update of document `id` fail.
    pub async fn fail_updates_for(&self, id: &str) {
        self.failing.lock().await.insert(id.to_string());
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> DocumentResult<Vec<Document>> {
        Ok(self
            .documents
            .lock()
            .await
            .iter()
            .filter(|((c, _), data)| {
                c == collection && data.get(field).and_then(Value::as_str) == Some(value)
            })
            .map(|((c, id), data)| Document {
                collection: c.clone(),
                id: id.clone(),
                data: data.clone(),
                updated_at: Utc::now(),
            })
            .collect())
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> DocumentResult<()> {
        if self.failing.lock().await.contains(id) {
            return Err(DocumentError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        let mut documents = self.documents.lock().await;
        let doc = documents
            .get_mut(&(collection.to_string(), id.to_string()))
            .ok_or_else(|| DocumentError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        doc.extend(fields);
        Ok(())
    }
}

/// Scripted network: fixed responses per URL, an offline switch and a call log.
#[derive(Default)]
pub struct FakeNetwork {
    responses: Mutex<HashMap<String, (StatusCode, Bytes)>>,
    failures: Mutex<HashSet<String>>,
    offline: Mutex<bool>,
    calls: Mutex<Vec<(Url, CacheMode)>>,
}

impl FakeNetwork {
    pub async fn respond(&self, url: Url, status: StatusCode, body: impl Into<Bytes>) {
        self.responses
            .lock()
            .await
            .insert(url.to_string(), (status, body.into()));
    }

    /// Make requests for `url` fail at the network level.
    pub async fn fail(&self, url: Url) {
        self.failures.lock().await.insert(url.to_string());
    }

    pub async fn go_offline(&self) {
        *self.offline.lock().await = true;
    }

    pub async fn go_online(&self) {
        *self.offline.lock().await = false;
    }

    pub async fn calls(&self) -> Vec<(Url, CacheMode)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &FetchRequest, mode: CacheMode) -> Result<FetchResponse, CacheError> {
        self.calls.lock().await.push((request.url.clone(), mode));
        let key = request.url.to_string();
        let unreachable = *self.offline.lock().await || self.failures.lock().await.contains(&key);
        if unreachable {
            return Err(CacheError::Network {
                url: key,
                reason: "unreachable".into(),
            });
        }
        let (status, body) = self
            .responses
            .lock()
            .await
            .get(&key)
            .cloned()
            .unwrap_or((StatusCode::NOT_FOUND, Bytes::new()));
        Ok(FetchResponse::new(status, request.url.clone(), body))
    }
}
