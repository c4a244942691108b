//! HTTP handlers for the document collections that reference images.

use crate::{
    errors::AppError, handlers::caller::Caller, models::document::Document,
    services::document_service::DocumentService,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Map, Value};

/// PUT `/documents/{collection}/{id}`: replace the whole document.
pub async fn put_document(
    State(service): State<DocumentService>,
    Path((collection, id)): Path<(String, String)>,
    caller: Caller,
    Json(data): Json<Map<String, Value>>,
) -> Result<Json<Document>, AppError> {
    caller.require_user()?;
    let doc = service.put(&collection, &id, data).await?;
    tracing::debug!(collection = %collection, id = %id, "document stored");
    Ok(Json(doc))
}

/// GET `/documents/{collection}/{id}`
pub async fn get_document(
    State(service): State<DocumentService>,
    Path((collection, id)): Path<(String, String)>,
    caller: Caller,
) -> Result<Json<Document>, AppError> {
    caller.require_user()?;
    Ok(Json(service.get(&collection, &id).await?))
}
