//! Upload intake
//!
//! Publisher side of the pipeline. An upload is staged into a temporary
//! `upload-*.csv` artifact, checked, and either published as an
//! [`UploadEvent`] or deleted again. Once published, the artifact belongs to
//! whoever consumes the event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{error, info, warn};

use crate::events::{ChannelError, EventChannel};
use crate::models::UploadEvent;

/// Header every upload must start with (compared case-insensitively)
pub const EXPECTED_HEADER: &str = "id,firstName,lastName,email";

/// Template offered to users who need an example upload
pub const SAMPLE_CSV: &str = "id,firstName,lastName,email\n\
                              1,Alice,Johnson,alice@example.com\n\
                              2,Bob,Smith,bob.smith@example.com";

const ARTIFACT_PREFIX: &str = "upload-";
const ARTIFACT_SUFFIX: &str = ".csv";

// Anything longer than this cannot be the expected header
const HEADER_READ_LIMIT: u64 = 1024;

/// Reasons an upload is turned away
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid file. Please upload a non-empty CSV.")]
    InvalidFile,

    #[error("Invalid CSV File. Expected a file with following headers: {EXPECTED_HEADER}")]
    InvalidHeader,

    #[error("CSV must have at least one data row.")]
    NoDataRows,

    #[error("Error uploading file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error uploading file: {0}")]
    Publish(#[from] ChannelError),
}

impl UploadError {
    /// Whether the upload itself was at fault, as opposed to the system
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            UploadError::InvalidFile | UploadError::InvalidHeader | UploadError::NoDataRows
        )
    }
}

/// Stages uploads and publishes them onto an [`EventChannel`]
#[derive(Clone)]
pub struct UploadIntake {
    channel: Arc<EventChannel>,
    staging_dir: PathBuf,
}

impl UploadIntake {
    pub fn new(channel: Arc<EventChannel>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            staging_dir: staging_dir.into(),
        }
    }

    /// Stage the contents of `source` and publish it
    ///
    /// `source_name` is the name the upload arrived under; only its suffix is
    /// inspected. On any error the staged artifact is removed.
    pub async fn accept<R>(
        &self,
        source_name: &str,
        mut source: R,
    ) -> Result<UploadEvent, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        if !source_name.ends_with(ARTIFACT_SUFFIX) {
            error!(source = source_name, "{}", UploadError::InvalidFile);
            return Err(UploadError::InvalidFile);
        }

        let staged = tempfile::Builder::new()
            .prefix(ARTIFACT_PREFIX)
            .suffix(ARTIFACT_SUFFIX)
            .tempfile_in(&self.staging_dir)
            .map_err(|e| self.log_failure(source_name, e))?;

        let copied = {
            let reopened = staged
                .reopen()
                .map_err(|e| self.log_failure(source_name, e))?;
            let mut sink = File::from_std(reopened);
            tokio::io::copy(&mut source, &mut sink)
                .await
                .map_err(|e| self.log_failure(source_name, e))?
        };

        // Returning early drops `staged`, which deletes the artifact.
        if copied == 0 {
            error!(source = source_name, "{}", UploadError::InvalidFile);
            return Err(UploadError::InvalidFile);
        }

        check_contents(staged.path())
            .await
            .inspect_err(|e| error!(source = source_name, "{e}"))?;

        let location = staged
            .into_temp_path()
            .keep()
            .map_err(|e| self.log_failure(source_name, e.error))?;

        let event = UploadEvent::new(location);
        if let Err(e) = self.channel.publish(event.clone()) {
            error!(source = source_name, error = %e, "Upload failed");
            if let Err(remove) = tokio::fs::remove_file(&event.location).await {
                warn!(
                    path = %event.location.display(),
                    error = %remove,
                    "Could not delete temp file"
                );
            }
            return Err(e.into());
        }

        info!(
            source = source_name,
            path = %event.location.display(),
            bytes = copied,
            "File uploaded successfully. Processing started."
        );

        Ok(event)
    }

    /// Stage and publish a file from the local filesystem
    ///
    /// The source file is left untouched; only the staged copy is consumed.
    pub async fn accept_path(&self, path: &Path) -> Result<UploadEvent, UploadError> {
        let source_name = path.to_string_lossy();
        let file = File::open(path)
            .await
            .map_err(|e| self.log_failure(&source_name, e))?;

        self.accept(&source_name, file).await
    }

    fn log_failure(&self, source_name: &str, e: std::io::Error) -> UploadError {
        error!(
            source = source_name,
            staging_dir = %self.staging_dir.display(),
            error = %e,
            "Upload failed"
        );
        UploadError::Io(e)
    }
}

/// Header must match and at least one more line must follow
///
/// Like the reader, invalid UTF-8 is decoded lossily rather than rejected.
async fn check_contents(path: &Path) -> Result<(), UploadError> {
    let mut reader = BufReader::new(File::open(path).await?);

    let mut header = Vec::new();
    (&mut reader)
        .take(HEADER_READ_LIMIT)
        .read_until(b'\n', &mut header)
        .await?;
    if !String::from_utf8_lossy(&header)
        .trim()
        .eq_ignore_ascii_case(EXPECTED_HEADER)
    {
        return Err(UploadError::InvalidHeader);
    }

    if reader.fill_buf().await?.is_empty() {
        return Err(UploadError::NoDataRows);
    }

    Ok(())
}
