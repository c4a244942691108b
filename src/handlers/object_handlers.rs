//! HTTP handlers for object and bucket operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`.

use crate::{
    errors::AppError,
    handlers::caller::Caller,
    models::{
        metadata::MetadataMap,
        object::{Object, ObjectWrite, StoredObject},
    },
    services::storage_service::{StorageError, StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;

pub const PUBLIC_HEADER: &str = "x-object-public";
pub const META_HEADER_PREFIX: &str = "x-meta-";

const MAX_SIGNED_TTL_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListObjectsResponse {
    pub bucket: String,
    pub prefix: String,
    pub objects: Vec<StoredObject>,
}

/// Optional body for `PUT /buckets/{bucket}`.
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    pub region: Option<String>,
}

/// Signature presented on a read.
#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetPublicReq {
    pub public: bool,
}

#[derive(Debug, Deserialize)]
pub struct SignQuery {
    /// Lifetime of the URL in seconds; one hour when absent.
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SignedUrlResponse {
    pub url: String,
    pub expires: i64,
}

/// Upload an object to `/objects/{bucket}/{*key}`.
///
/// `Content-Type` is recorded as is, `x-object-public: true` marks the object
/// public and every `x-meta-<name>` header becomes a custom metadata entry.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    caller: Caller,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    caller.require_user()?;
    let write = object_write_from_headers(&headers);

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let stored = service
        .upload_object_stream(&bucket, &key, write, stream)
        .await?;
    tracing::info!(bucket = %bucket, key = %key, size = stored.object.size_bytes, "object uploaded");

    let mut resp_headers = HeaderMap::new();
    if let Some(value) = quoted_etag(&stored.object) {
        resp_headers.insert(header::ETAG, value);
    }
    Ok((StatusCode::OK, resp_headers, Json(stored)))
}

/// Download `/objects/{bucket}/{*key}` as a streaming response.
///
/// Public objects are readable by anyone. Private ones need either a valid
/// signature or a caller identity. A presented signature that does not verify
/// is always rejected. Anonymous callers get 403 for private and missing
/// objects alike.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(signed): Query<SignedQuery>,
    caller: Caller,
) -> Result<Response, AppError> {
    let access = authorize_read(&service, &bucket, &key, &signed, &caller)?;
    let stored = readable_metadata(&service, &bucket, &key, access).await?;

    let (object, file) = service.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &object, &stored.metadata);

    Ok(response)
}

/// HEAD `/objects/{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(signed): Query<SignedQuery>,
    caller: Caller,
) -> Result<Response, AppError> {
    let access = authorize_read(&service, &bucket, &key, &signed, &caller)?;
    let stored = readable_metadata(&service, &bucket, &key, access).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &stored.object, &stored.metadata);

    Ok(response)
}

/// PATCH `/objects/{bucket}/{*key}`: flip the public flag.
pub async fn set_object_public(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    caller: Caller,
    Json(req): Json<SetPublicReq>,
) -> Result<impl IntoResponse, AppError> {
    caller.require_user()?;
    service.set_public(&bucket, &key, req.public).await?;
    Ok(Json(service.get_object_metadata(&bucket, &key).await?))
}

/// DELETE `/objects/{bucket}/{*key}`: soft-delete object.
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    caller: Caller,
) -> Result<StatusCode, AppError> {
    caller.require_user()?;
    service.delete_object(&bucket, &key).await?;
    tracing::info!(bucket = %bucket, key = %key, "object deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/sign/{bucket}/{*key}?ttl_secs=`: issue a signed read URL.
pub async fn sign_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<SignQuery>,
    caller: Caller,
) -> Result<Json<SignedUrlResponse>, AppError> {
    caller.require_user()?;
    let ttl = q.ttl_secs.unwrap_or(3600);
    if !(1..=MAX_SIGNED_TTL_SECS).contains(&ttl) {
        return Err(AppError::bad_request(format!(
            "ttl_secs must be between 1 and {}",
            MAX_SIGNED_TTL_SECS
        )));
    }
    let expires = Utc::now() + Duration::seconds(ttl);
    let url = service.signed_url(&bucket, &key, expires).await?;
    Ok(Json(SignedUrlResponse {
        url,
        expires: expires.timestamp(),
    }))
}

/// GET `/buckets/{bucket}?prefix=`: JSON listing in key order.
pub async fn list_objects(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsQuery>,
    caller: Caller,
) -> Result<Json<ListObjectsResponse>, AppError> {
    caller.require_user()?;
    let prefix = q.prefix.unwrap_or_default();
    let objects = service.list_objects(&bucket, Some(&prefix)).await?;
    Ok(Json(ListObjectsResponse {
        bucket,
        prefix,
        objects,
    }))
}

/// PUT `/buckets/{bucket}`: create bucket.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    caller: Caller,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let admin = caller.require_admin()?;
    let payload: Option<CreateBucketReq> = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|err| AppError::bad_request(format!("invalid body: {}", err)))?,
        )
    };
    let region = payload
        .and_then(|p| p.region)
        .unwrap_or_else(|| "local".into());

    let created = service.create_bucket(&bucket, &region, Some(admin)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE `/buckets/{bucket}`: delete bucket.
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    caller: Caller,
) -> Result<impl IntoResponse, AppError> {
    caller.require_admin()?;
    service.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// What a read request may see, decided before the object is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadAccess {
    /// Valid signature or identified caller.
    Granted,
    /// Anonymous caller: public objects only.
    PublicOnly,
}

fn authorize_read(
    service: &StorageService,
    bucket: &str,
    key: &str,
    signed: &SignedQuery,
    caller: &Caller,
) -> Result<ReadAccess, AppError> {
    match (signed.expires, signed.signature.as_deref()) {
        (None, None) if caller.user_id.is_some() => Ok(ReadAccess::Granted),
        (None, None) => Ok(ReadAccess::PublicOnly),
        (Some(expires), Some(signature))
            if service.verify_signature(bucket, key, expires, signature) =>
        {
            Ok(ReadAccess::Granted)
        }
        _ => Err(AppError::forbidden("invalid or expired signature")),
    }
}

async fn readable_metadata(
    service: &StorageService,
    bucket: &str,
    key: &str,
    access: ReadAccess,
) -> Result<StoredObject, AppError> {
    match (service.get_object_metadata(bucket, key).await, access) {
        (Ok(stored), ReadAccess::Granted) => Ok(stored),
        (Ok(stored), ReadAccess::PublicOnly) if stored.object.is_public => Ok(stored),
        (Ok(_), ReadAccess::PublicOnly)
        | (
            Err(StorageError::BucketNotFound(_) | StorageError::ObjectNotFound { .. }),
            ReadAccess::PublicOnly,
        ) => Err(AppError::forbidden("object is private")),
        (Err(err), _) => Err(err.into()),
    }
}

fn object_write_from_headers(headers: &HeaderMap) -> ObjectWrite {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let public = headers
        .get(PUBLIC_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

    let mut metadata = MetadataMap::new();
    for (name, value) in headers {
        let Some(meta_key) = name.as_str().strip_prefix(META_HEADER_PREFIX) else {
            continue;
        };
        if meta_key.is_empty() {
            continue;
        }
        if let Ok(value) = value.to_str() {
            metadata.insert(meta_key.to_string(), value.to_string());
        }
    }

    ObjectWrite {
        content_type,
        metadata,
        public,
    }
}

fn quoted_etag(object: &Object) -> Option<HeaderValue> {
    let etag = object.etag.as_ref()?;
    HeaderValue::from_str(&format!("\"{}\"", etag)).ok()
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object, metadata: &MetadataMap) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );

    if let Some(value) = quoted_etag(meta) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    if meta.is_public {
        headers.insert(
            HeaderName::from_static(PUBLIC_HEADER),
            HeaderValue::from_static("true"),
        );
    }

    // Custom metadata travels back as x-meta-* headers; names are lowercased.
    for (key, value) in metadata {
        let name = HeaderName::from_bytes(format!("{META_HEADER_PREFIX}{key}").as_bytes());
        if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_headers_become_object_write() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
        headers.insert(PUBLIC_HEADER, HeaderValue::from_static("True"));
        headers.insert("x-meta-trip", HeaderValue::from_static("dahab"));
        headers.insert("x-meta-", HeaderValue::from_static("ignored"));
        headers.insert("x-other", HeaderValue::from_static("ignored"));

        let write = object_write_from_headers(&headers);
        assert_eq!(write.content_type.as_deref(), Some("image/png"));
        assert!(write.public);
        assert_eq!(write.metadata.len(), 1);
        assert_eq!(write.metadata["trip"], "dahab");
    }

    #[test]
    fn missing_public_header_means_private() {
        let write = object_write_from_headers(&HeaderMap::new());
        assert!(!write.public);
        assert!(write.content_type.is_none());
    }
}
