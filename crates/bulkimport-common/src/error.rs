//! Error types shared across the bulk import workspace

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for bulk import operations
pub type Result<T> = std::result::Result<T, BulkImportError>;

/// Main error type for bulk import
#[derive(Error, Debug)]
pub enum BulkImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),
}

impl BulkImportError {
    /// Whether this error means the referenced file was absent
    pub fn is_not_found(&self) -> bool {
        match self {
            BulkImportError::FileNotFound(_) => true,
            BulkImportError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
