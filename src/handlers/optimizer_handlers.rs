//! HTTP surface of the image optimization pipeline.
//!
//! - POST /optimizer/bulk      (admin)  optimize everything under a prefix
//! - GET  /optimizer/stats     (user)   savings report
//! - POST /optimizer/finalize  (admin)  run one finalize event synchronously

use crate::{
    errors::AppError,
    handlers::caller::Caller,
    models::optimization::{
        BulkReport, BulkRequest, FinalizeEvent, OptimizationOutcome, OptimizationStats,
    },
    services::optimizer_service::OptimizerService,
};
use axum::{Json, extract::State};
use bytes::Bytes;
use std::sync::Arc;

pub async fn bulk_optimize(
    State(optimizer): State<Arc<OptimizerService>>,
    caller: Caller,
    body: Bytes,
) -> Result<Json<BulkReport>, AppError> {
    let admin = caller.require_admin()?;
    // An empty body means "default bucket, default prefix".
    let request: BulkRequest = if body.is_empty() {
        BulkRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid body: {}", err)))?
    };
    tracing::info!(caller = admin, ?request, "bulk optimization requested");
    Ok(Json(optimizer.optimize_existing(request).await?))
}

pub async fn optimization_stats(
    State(optimizer): State<Arc<OptimizerService>>,
    caller: Caller,
) -> Result<Json<OptimizationStats>, AppError> {
    caller.require_user()?;
    Ok(Json(optimizer.stats().await?))
}

pub async fn run_finalize(
    State(optimizer): State<Arc<OptimizerService>>,
    caller: Caller,
    Json(event): Json<FinalizeEvent>,
) -> Result<Json<OptimizationOutcome>, AppError> {
    caller.require_admin()?;
    Ok(Json(optimizer.handle_finalize(&event).await))
}
