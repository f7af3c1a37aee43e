//! Data carried through the ingestion pipeline

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validator::ValidationError;

/// Notification that an uploaded artifact is ready for ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEvent {
    /// Filesystem path of the temporary artifact
    pub location: PathBuf,
}

impl UploadEvent {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

/// A validated user row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

/// A line that failed parsing or validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
    /// 1-based physical line in the source file (first data row is 2)
    pub line_number: usize,
    /// The line exactly as read, before field trimming
    pub raw_line: String,
    pub reason: ValidationError,
}

/// Output of reading one file: valid records and row failures, in line order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionBatch {
    pub records: Vec<UserRecord>,
    pub failures: Vec<RowFailure>,
}

impl IngestionBatch {
    /// Number of data lines consumed
    pub fn rows_seen(&self) -> usize {
        self.records.len() + self.failures.len()
    }
}

/// Summary of one file's processing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResult {
    /// Records appended to the store for this file
    pub records_stored: usize,
    pub failures: Vec<RowFailure>,
}
