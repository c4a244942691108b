//! OptimizerService: turns freshly uploaded images into bounded, re-encoded
//! derivatives and repoints every document that referenced the original.
//!
//! Flow for one finalize event:
//! 1. eligibility filter (content type, derivative marker, skip patterns, existence)
//! 2. download + transform on the blocking pool
//! 3. write the derivative next to the source with provenance metadata
//! 4. issue a long-lived signed URL
//! 5. rewrite references across the trip, agency and user collections
//!
//! Nothing here returns an error to the trigger: failures end up in
//! [`OptimizationResult::error`].

use crate::config::OptimizerConfig;
use crate::models::{
    document::{OPTIMIZED_AT_FIELD, REFERENCE_TARGETS, ReferenceTarget},
    metadata::{MetadataMap, keys},
    object::ObjectWrite,
    optimization::{
        BulkReport, BulkRequest, FinalizeEvent, OptimizationOutcome, OptimizationResult,
        OptimizationStats, RewriteReport, SkipReason,
    },
};
use crate::services::{
    image_transform::{self, TransformError, TransformSettings},
    object_store::{DocumentStore, ObjectStore},
    signing::far_future_expiry,
    storage_service::StorageError,
};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn};

const OPTIMIZED_BY: &str = "tripbasket-image-optimizer";

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("image worker failed: {0}")]
    Worker(#[from] JoinError),
}

pub struct OptimizerService {
    store: Arc<dyn ObjectStore>,
    documents: Arc<dyn DocumentStore>,
    config: OptimizerConfig,
    default_bucket: String,
    bulk_prefix: String,
}

impl OptimizerService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        documents: Arc<dyn DocumentStore>,
        config: OptimizerConfig,
        default_bucket: impl Into<String>,
        bulk_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            documents,
            config,
            default_bucket: default_bucket.into(),
            bulk_prefix: bulk_prefix.into(),
        }
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// `<dir>/<prefix><stem>.<ext>`, where the stem is the filename up to its
    /// first `.`. Deterministic, so re-optimizing overwrites in place.
    pub fn derivative_path(&self, source: &str) -> String {
        let (directory, filename) = match source.rsplit_once('/') {
            Some((dir, file)) => (Some(dir), file),
            None => (None, source),
        };
        let stem = filename.split('.').next().unwrap_or(filename);
        let derived = format!(
            "{}{}.{}",
            self.config.optimized_prefix,
            stem,
            self.config.output_format.extension()
        );
        match directory {
            Some(dir) if !dir.is_empty() => format!("{}/{}", dir, derived),
            _ => derived,
        }
    }

    fn is_derivative(&self, name: &str) -> bool {
        name.contains(&self.config.optimized_prefix)
    }

    /// The pure part of the eligibility filter, in order.
    fn skip_reason(&self, event: &FinalizeEvent) -> Option<SkipReason> {
        let is_image = event
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"));
        if !is_image {
            return Some(SkipReason::NotAnImage);
        }
        if self.is_derivative(&event.name) {
            return Some(SkipReason::AlreadyOptimized);
        }
        let lowered = event.name.to_lowercase();
        if self
            .config
            .skip_patterns
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
        {
            return Some(SkipReason::SkipPattern);
        }
        None
    }

    /// Entry point for a finalize event. Never fails.
    pub async fn handle_finalize(&self, event: &FinalizeEvent) -> OptimizationOutcome {
        if let Some(reason) = self.skip_reason(event) {
            debug!(object = %event.name, ?reason, "skipping optimization");
            return OptimizationOutcome::skipped(reason);
        }

        match self.store.exists(&event.bucket, &event.name).await {
            Ok(true) => {}
            Ok(false) => {
                info!(object = %event.name, "source no longer exists, skipping");
                return OptimizationOutcome::skipped(SkipReason::SourceMissing);
            }
            Err(err) => {
                error!(object = %event.name, "failed to check source: {}", err);
                return OptimizationOutcome::Processed(OptimizationResult::failed(
                    &event.name,
                    err,
                ));
            }
        }

        info!(bucket = %event.bucket, object = %event.name, "starting optimization");
        let result = match self.optimize(&event.bucket, &event.name).await {
            Ok(result) => result,
            Err(err) => {
                error!(object = %event.name, "optimization failed: {}", err);
                OptimizationResult::failed(&event.name, err)
            }
        };
        OptimizationOutcome::Processed(result)
    }

    async fn optimize(&self, bucket: &str, name: &str) -> Result<OptimizationResult, OptimizeError> {
        let source = self.store.head(bucket, name).await?;
        let data = self.store.download(bucket, name).await?;
        let original_size = data.len() as u64;

        let settings = TransformSettings::from(&self.config);
        let transformed = tokio::task::spawn_blocking(move || {
            image_transform::transform(&data, &settings)
        })
        .await??;

        debug!(
            object = name,
            source = %transformed.source,
            output = %transformed.output,
            format = ?transformed.source_format,
            resized = transformed.resized,
            "image transformed"
        );

        let optimized_size = transformed.bytes.len() as u64;
        let optimized_path = self.derivative_path(name);

        let mut metadata = MetadataMap::new();
        metadata.insert(keys::ORIGINAL_FILE.into(), name.to_string());
        metadata.insert(keys::OPTIMIZED_BY.into(), OPTIMIZED_BY.into());
        metadata.insert(keys::ORIGINAL_SIZE.into(), original_size.to_string());
        metadata.insert(keys::OPTIMIZED_SIZE.into(), optimized_size.to_string());
        metadata.insert(
            keys::COMPRESSION_RATIO.into(),
            format!("{}%", percent(original_size, optimized_size)),
        );
        metadata.insert(
            keys::ORIGINAL_DIMENSIONS.into(),
            transformed.source.to_string(),
        );
        metadata.insert(
            keys::OPTIMIZED_DIMENSIONS.into(),
            transformed.output.to_string(),
        );
        metadata.insert(keys::OPTIMIZED_AT.into(), timestamp());

        let write = ObjectWrite {
            content_type: Some(self.config.output_format.content_type().into()),
            metadata,
            public: source.object.is_public,
        };
        self.store
            .save(bucket, &optimized_path, Bytes::from(transformed.bytes), write)
            .await?;

        let url = self
            .store
            .signed_url(bucket, &optimized_path, far_future_expiry())
            .await?;

        let savings = original_size as i64 - optimized_size as i64;
        let savings_percent = percent(original_size, optimized_size);
        info!(
            object = name,
            derivative = %optimized_path,
            original_size,
            optimized_size,
            savings,
            "optimization completed ({}%)",
            savings_percent
        );

        let report = self.rewrite_references(name, &optimized_path, &url).await;
        info!(
            object = name,
            updated = report.updated,
            failed = report.failed,
            "references rewritten"
        );

        Ok(OptimizationResult {
            success: true,
            original_file: name.to_string(),
            optimized_file: Some(optimized_path),
            original_size: Some(original_size),
            optimized_size: Some(optimized_size),
            savings: Some(savings),
            savings_percent: Some(savings_percent),
            error: None,
        })
    }

    /// Repoint every document referencing `original` at the derivative.
    ///
    /// Each query and each update stands alone: a failure is logged and
    /// counted, siblings still run. Nothing is rolled back.
    pub async fn rewrite_references(&self, original: &str, optimized: &str, url: &str) -> RewriteReport {
        let lookups = REFERENCE_TARGETS.iter().map(|target| async move {
            let found = self
                .documents
                .find_by_field(target.collection, target.path_field, original)
                .await;
            (target, found)
        });

        let mut report = RewriteReport::default();
        let mut updates = Vec::new();
        let optimized_at = timestamp();
        for (target, found) in join_all(lookups).await {
            match found {
                Ok(documents) => {
                    for doc in documents {
                        let fields = rewrite_fields(target, optimized, url, &optimized_at);
                        updates.push(async move {
                            let outcome = self
                                .documents
                                .update_fields(target.collection, &doc.id, fields)
                                .await;
                            (target.collection, doc.id, outcome)
                        });
                    }
                }
                Err(err) => {
                    warn!(collection = target.collection, "reference lookup failed: {}", err);
                    report.failed += 1;
                }
            }
        }

        for (collection, id, outcome) in join_all(updates).await {
            match outcome {
                Ok(()) => {
                    debug!(collection, id = %id, "reference updated");
                    report.updated += 1;
                }
                Err(err) => {
                    warn!(collection, id = %id, "reference update failed: {}", err);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Optimize every eligible image under `prefix` concurrently.
    pub async fn optimize_existing(&self, request: BulkRequest) -> Result<BulkReport, OptimizeError> {
        let bucket = request.bucket.unwrap_or_else(|| self.default_bucket.clone());
        let prefix = request.path.unwrap_or_else(|| self.bulk_prefix.clone());

        let objects = self.store.list(&bucket, &prefix).await?;
        let total_files = objects.len();

        let events: Vec<FinalizeEvent> = objects
            .into_iter()
            .filter(|stored| !self.is_derivative(&stored.object.key) && stored.object.is_image())
            .map(|stored| FinalizeEvent {
                bucket: bucket.clone(),
                name: stored.object.key,
                content_type: stored.object.content_type,
            })
            .collect();
        let processed = events.len();
        info!(bucket = %bucket, prefix = %prefix, processed, "bulk optimization started");

        let outcomes = join_all(events.iter().map(|event| self.handle_finalize(event))).await;
        let failed = outcomes
            .iter()
            .filter(|outcome| outcome.result().is_some_and(|r| !r.success))
            .count();

        Ok(BulkReport {
            message: "Bulk optimization completed".into(),
            total_files,
            processed,
            successful: processed - failed,
            failed,
        })
    }

    /// Read-only savings report over the default bucket and prefix.
    pub async fn stats(&self) -> Result<OptimizationStats, OptimizeError> {
        let objects = self.store.list(&self.default_bucket, &self.bulk_prefix).await?;

        let mut total_original_size = 0u64;
        let mut total_optimized_size = 0u64;
        let mut original_images = 0;
        let mut optimized_images = 0;

        for stored in &objects {
            if self.is_derivative(&stored.object.key) {
                optimized_images += 1;
                total_optimized_size += stored
                    .metadata
                    .get(keys::OPTIMIZED_SIZE)
                    .and_then(|size| size.parse::<u64>().ok())
                    .unwrap_or(0);
            } else if stored.object.is_image() {
                original_images += 1;
                total_original_size += stored.object.size_bytes.max(0) as u64;
            }
        }

        let total_savings = total_original_size as i64 - total_optimized_size as i64;
        Ok(OptimizationStats {
            total_files: objects.len(),
            original_images,
            optimized_images,
            total_original_size,
            total_optimized_size,
            total_savings,
            savings_percent: percent(total_original_size, total_optimized_size),
        })
    }

    /// Process finalize events as they arrive, each on its own task.
    pub fn spawn_finalize_listener(
        self: Arc<Self>,
        mut events: mpsc::Receiver<FinalizeEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let optimizer = Arc::clone(&self);
                tokio::spawn(async move {
                    match optimizer.handle_finalize(&event).await {
                        OptimizationOutcome::Processed(result) if !result.success => {
                            warn!(object = %result.original_file, "finalize run failed");
                        }
                        outcome => debug!(object = %event.name, ?outcome, "finalize handled"),
                    }
                });
            }
            debug!("finalize event channel closed");
        })
    }
}

fn rewrite_fields(
    target: &ReferenceTarget,
    optimized: &str,
    url: &str,
    optimized_at: &str,
) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(target.path_field.into(), Value::from(optimized));
    fields.insert(target.url_field.into(), Value::from(url));
    fields.insert(OPTIMIZED_AT_FIELD.into(), Value::from(optimized_at));
    fields
}

/// Share of `original` saved, as a two-decimal percentage string.
fn percent(original: u64, optimized: u64) -> String {
    if original == 0 {
        return "0.00".into();
    }
    let saved = original as f64 - optimized as f64;
    format!("{:.2}", saved / original as f64 * 100.0)
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
