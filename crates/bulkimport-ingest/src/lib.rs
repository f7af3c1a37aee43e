//! Bulk Import Ingest Library
//!
//! Event-driven ingestion of user CSV uploads.
//!
//! An upload is staged by [`UploadIntake`], announced on an [`EventChannel`]
//! and picked up by the [`IngestionCoordinator`], which validates every data
//! row, appends the valid ones to a [`UserStore`] and deletes the artifact.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bulkimport_ingest::{
//!     EventChannel, IngestConfig, IngestionCoordinator, InMemoryUserStore, UploadIntake,
//!     UserStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let store = InMemoryUserStore::new();
//!     let channel = Arc::new(EventChannel::spawn());
//!
//!     let coordinator = IngestionCoordinator::new(Arc::new(store.clone()), &config);
//!     coordinator.register(&channel);
//!
//!     let intake = UploadIntake::new(channel.clone(), &config.staging_dir);
//!     intake.accept_path("users.csv".as_ref()).await?;
//!
//!     channel.close().await;
//!     coordinator.wait_idle().await;
//!     println!("{} users imported", store.snapshot().len());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod artifact;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod intake;
pub mod models;
pub mod reader;
pub mod store;
pub mod validator;

pub use config::IngestConfig;
pub use coordinator::{FileOutcome, IngestionCoordinator, IngestionReport, ProcessingState};
pub use events::{ChannelError, EventChannel, EventHandler, FnHandler};
pub use intake::{UploadError, UploadIntake, EXPECTED_HEADER, SAMPLE_CSV};
pub use models::{IngestionResult, RowFailure, UploadEvent, UserRecord};
pub use store::{InMemoryUserStore, UserStore};
pub use validator::{UserField, ValidationError};
