//! StorageService: bucket and object operations backed by SQLite for the
//! object records and custom metadata, and local disk for payloads sharded
//! beneath `base_path/{bucket}/{shard}/{shard}/{key}`.
//!
//! Every completed write publishes a [`FinalizeEvent`] when an event sender
//! is attached, which is how the optimization pipeline gets triggered.

use crate::models::{
    bucket::Bucket,
    metadata::{MetadataMap, ObjectMetadata},
    object::{Object, ObjectWrite, StoredObject},
    optimization::FinalizeEvent,
};
use crate::services::signing::UrlSigner;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::mpsc,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// StorageService provides the object store operations the rest of the
/// service consumes:
/// - Upload an object (writes bytes to disk, upserts its record and metadata)
/// - Read an object's record, metadata and payload
/// - List objects under a prefix
/// - Soft-delete objects and remove their payloads
/// - Issue and verify signed read URLs
#[derive(Clone)]
pub struct StorageService {
    /// Pool holding object records, metadata and documents.
    pub db: Arc<SqlitePool>,

    /// Root of the sharded payload tree.
    pub base_path: PathBuf,

    signer: UrlSigner,
    events: Option<mpsc::Sender<FinalizeEvent>>,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

const OBJECT_COLUMNS: &str = "id, bucket_id, key, filename, content_type, size_bytes, etag, \
     is_public, last_modified, is_deleted";

impl StorageService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            signer,
            events: None,
        }
    }

    /// Publish a [`FinalizeEvent`] on `sender` after every successful upload.
    pub fn with_finalize_events(mut self, sender: mpsc::Sender<FinalizeEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Rejects empty or overlong keys, absolute keys, `..` segments and
    /// control characters.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// DNS-style bucket names: 3 to 63 of `[a-z0-9.-]`, alphanumeric at both
    /// ends, no `..`, `.-` or `-.` runs.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard identifiers for an object key: the first two bytes of
    /// MD5(bucket/key) as lowercase hex.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// base_path/bucket/{shard}/{shard}/{key}. Parent directories may not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, created_by, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0"
        ))
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    async fn fetch_metadata(&self, object_id: Uuid) -> StorageResult<MetadataMap> {
        let rows = sqlx::query_as::<_, ObjectMetadata>(
            "SELECT object_id, key, value FROM object_metadata WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(|row| (row.key, row.value)).collect())
    }

    /// Replace an object's custom metadata in a single transaction.
    async fn replace_metadata(&self, object_id: Uuid, metadata: &MetadataMap) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        for (key, value) in metadata {
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object_id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Write `stream` to a temp file beside its final location, hashing as it
    /// goes, then rename it into place and upsert the record. Overwrites
    /// replace the payload, the public flag and all custom metadata. A
    /// finalize event follows every successful write.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        write: ObjectWrite,
        stream: S,
    ) -> StorageResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let written = write_payload(&tmp_path, stream).await;
        let (size_bytes, etag) = match written {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        let filename = key.rsplit('/').next().unwrap_or(key).to_string();

        let insert_result = sqlx::query_as::<_, Object>(&format!(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, filename, content_type, size_bytes,
                etag, is_public, last_modified, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                is_public = excluded.is_public,
                last_modified = excluded.last_modified,
                is_deleted = 0
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(bucket_rec.id)
        .bind(key)
        .bind(&filename)
        .bind(write.content_type.clone())
        .bind(size_bytes)
        .bind(&etag)
        .bind(write.public)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        let object = match insert_result {
            Ok(obj) => obj,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };
        self.replace_metadata(object.id, &write.metadata).await?;

        debug!(bucket, key, size_bytes, "object written");
        self.publish_finalize(&bucket_rec.name, &object);

        Ok(StoredObject {
            object,
            metadata: write.metadata,
        })
    }

    /// Upload an in-memory payload.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        write: ObjectWrite,
    ) -> StorageResult<StoredObject> {
        let body = stream::once(async move { Ok::<_, io::Error>(data) });
        self.upload_object_stream(bucket, key, write, body).await
    }

    fn publish_finalize(&self, bucket: &str, object: &Object) {
        let Some(sender) = &self.events else {
            return;
        };
        let event = FinalizeEvent {
            bucket: bucket.to_string(),
            name: object.key.clone(),
            content_type: object.content_type.clone(),
        };
        if let Err(err) = sender.try_send(event) {
            warn!(key = %object.key, "dropping finalize event: {}", err);
        }
    }

    /// Whether a live (non-deleted) object exists at `bucket/key`.
    pub async fn object_exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        match self.get_object_metadata(bucket, key).await {
            Ok(_) => Ok(true),
            Err(StorageError::ObjectNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Record plus an open payload handle for streaming. A record whose payload
    /// file is gone reads as ObjectNotFound.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let file = File::open(&file_path)
            .await
            .map_err(|err| missing_payload(err, bucket, key))?;

        Ok((object, file))
    }

    /// Read a whole object into memory.
    pub async fn read_object(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_object(&bucket_rec, key).await?;
        let file_path = self.object_path(&bucket_rec.name, key);
        let data = fs::read(&file_path)
            .await
            .map_err(|err| missing_payload(err, bucket, key))?;
        Ok(Bytes::from(data))
    }

    /// Fetch an object's record and custom metadata.
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;
        let metadata = self.fetch_metadata(object.id).await?;
        Ok(StoredObject { object, metadata })
    }

    /// List live objects whose key starts with `prefix`, in key order.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> StorageResult<Vec<StoredObject>> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let prefix = prefix.unwrap_or("");

        // substr() instead of LIKE so `_` and `%` in prefixes match literally.
        let objects = sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket_id = ? AND is_deleted = 0 AND substr(key, 1, length(?)) = ?
             ORDER BY key ASC"
        ))
        .bind(bucket_rec.id)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&*self.db)
        .await?;

        let rows = sqlx::query_as::<_, ObjectMetadata>(
            "SELECT m.object_id, m.key, m.value
             FROM object_metadata m JOIN objects o ON o.id = m.object_id
             WHERE o.bucket_id = ? AND o.is_deleted = 0 AND substr(o.key, 1, length(?)) = ?",
        )
        .bind(bucket_rec.id)
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&*self.db)
        .await?;

        let mut by_object: HashMap<Uuid, MetadataMap> = HashMap::new();
        for row in rows {
            by_object
                .entry(row.object_id)
                .or_default()
                .insert(row.key, row.value);
        }

        Ok(objects
            .into_iter()
            .map(|object| StoredObject {
                metadata: by_object.remove(&object.id).unwrap_or_default(),
                object,
            })
            .collect())
    }

    /// Mark an object publicly readable (or not).
    pub async fn set_public(&self, bucket: &str, key: &str, public: bool) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let result = sqlx::query(
            "UPDATE objects SET is_public = ? WHERE key = ? AND bucket_id = ? AND is_deleted = 0",
        )
        .bind(public)
        .bind(key)
        .bind(bucket_rec.id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Issue a signed read URL for an existing object.
    pub async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        expires: DateTime<Utc>,
    ) -> StorageResult<String> {
        self.get_object_metadata(bucket, key).await?;
        Ok(self.signer.sign(bucket, key, expires))
    }

    pub fn verify_signature(&self, bucket: &str, key: &str, expires: i64, signature: &str) -> bool {
        self.signer.verify(bucket, key, expires, signature)
    }

    /// Flag the record deleted, drop its metadata and payload, then prune the
    /// shard directories it leaves empty.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        sqlx::query("UPDATE objects SET is_deleted = 1 WHERE key = ? AND bucket_id = ?")
            .bind(key)
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(object)
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Returns BucketAlreadyExists if the name is taken.
    pub async fn create_bucket(
        &self,
        name: &str,
        region: &str,
        created_by: Option<&str>,
    ) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_by: created_by.map(str::to_string),
            region: region.to_lowercase(),
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, created_by, region, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(&bucket.created_by)
        .bind(&bucket.region)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Return the named bucket, creating it first if needed.
    pub async fn ensure_bucket(&self, name: &str) -> StorageResult<Bucket> {
        match self.fetch_bucket(name).await {
            Ok(bucket) => Ok(bucket),
            Err(StorageError::BucketNotFound(_)) => match self.create_bucket(name, "local", None).await {
                Err(StorageError::BucketAlreadyExists(_)) => self.fetch_bucket(name).await,
                other => other,
            },
            Err(err) => Err(err),
        }
    }

    /// Delete a bucket record and its payload directory.
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        self.ensure_bucket_name_safe(name)?;
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::BucketNotFound(name.to_string()));
        }

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }

        Ok(())
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty
                    ) =>
                {
                    break;
                }
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Stream `stream` into a new file at `path`, returning size and MD5 etag.
async fn write_payload<S>(path: &Path, stream: S) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut file = File::create(path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

fn missing_payload(err: io::Error, bucket: &str, key: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    } else {
        StorageError::Io(err)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
