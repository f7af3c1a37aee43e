//! Ingestion configuration

use std::path::PathBuf;
use std::time::Duration;

use bulkimport_common::{BulkImportError, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Ingestion Configuration Constants
// ============================================================================

/// Read timeout in seconds; 0 disables the timeout.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 0;

/// Environment variable naming the artifact staging directory.
pub const ENV_TEMP_DIR: &str = "BULKIMPORT_TEMP_DIR";

/// Environment variable for the read timeout in seconds.
pub const ENV_READ_TIMEOUT_SECS: &str = "BULKIMPORT_READ_TIMEOUT_SECS";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory where uploaded files are staged before ingestion
    pub staging_dir: PathBuf,

    /// Upper bound on reading one file, in seconds (0 = unbounded)
    pub read_timeout_secs: u64,
}

impl IngestConfig {
    /// Load configuration from the environment (and `.env`, if present)
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = IngestConfig {
            staging_dir: std::env::var(ENV_TEMP_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),
            read_timeout_secs: match std::env::var(ENV_READ_TIMEOUT_SECS) {
                Ok(raw) => raw.trim().parse().map_err(|_| {
                    BulkImportError::Config(format!(
                        "{ENV_READ_TIMEOUT_SECS} must be a whole number of seconds, got {raw:?}"
                    ))
                })?,
                Err(_) => defaults.read_timeout_secs,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.staging_dir.as_os_str().is_empty() {
            return Err(BulkImportError::Config(
                "Staging directory cannot be empty".to_string(),
            ));
        }

        if self.staging_dir.exists() && !self.staging_dir.is_dir() {
            return Err(BulkImportError::Config(format!(
                "Staging directory {} is not a directory",
                self.staging_dir.display()
            )));
        }

        Ok(())
    }

    /// Read timeout, if one is configured
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
        }
    }
}
