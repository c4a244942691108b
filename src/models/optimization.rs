//! Inputs and reports of the image optimization pipeline.

use serde::{Deserialize, Serialize};

/// Emitted whenever an object finishes writing to the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeEvent {
    pub bucket: String,
    pub name: String,
    pub content_type: Option<String>,
}

/// Why an event was not processed. None of these is an error.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAnImage,
    AlreadyOptimized,
    SkipPattern,
    SourceMissing,
}

/// Result record of a single optimization run.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    pub success: bool,
    pub original_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savings: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub savings_percent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OptimizationResult {
    pub fn failed(original_file: impl Into<String>, error: impl ToString) -> Self {
        Self {
            success: false,
            original_file: original_file.into(),
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OptimizationOutcome {
    Skipped { reason: SkipReason },
    Processed(OptimizationResult),
}

impl OptimizationOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    /// The run result, when the event was processed.
    pub fn result(&self) -> Option<&OptimizationResult> {
        match self {
            Self::Processed(result) => Some(result),
            Self::Skipped { .. } => None,
        }
    }
}

/// Per-write tally of a reference rewrite fan-out.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub updated: usize,
    pub failed: usize,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct BulkRequest {
    pub bucket: Option<String>,
    pub path: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub message: String,
    pub total_files: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationStats {
    pub total_files: usize,
    pub original_images: usize,
    pub optimized_images: usize,
    pub total_original_size: u64,
    pub total_optimized_size: u64,
    pub total_savings: i64,
    pub savings_percent: String,
}
