//! Ingestion coordinator
//!
//! Subscribes to the [`EventChannel`] and turns every [`UploadEvent`] into one
//! unit of work running on its own task:
//!
//! ```text
//! Notified -> Reading -> Ingested   -> Cleaned
//!                     -> ReadFailed -> Cleaned
//!                     -> (missing)  -> Cleaned
//! ```
//!
//! The delivery loop only spawns the unit of work, so a slow file never holds
//! up other events. Units run concurrently and may finish in any order. The
//! artifact is deleted on every path out of a unit of work.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bulkimport_common::{BulkImportError, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::artifact::{Deletion, TempArtifact};
use crate::config::IngestConfig;
use crate::events::{panic_message, EventChannel, EventHandler};
use crate::models::{IngestionBatch, IngestionResult, UploadEvent};
use crate::reader;
use crate::store::UserStore;

/// Per-file processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Notified,
    Reading,
    Ingested,
    ReadFailed,
    Cleaned,
}

/// How a unit of work ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested(IngestionResult),
    /// The artifact did not exist when processing started
    Missing,
    ReadFailed { reason: String },
}

/// Emitted once per processed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionReport {
    pub location: PathBuf,
    pub outcome: FileOutcome,
    pub deletion: Deletion,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl IngestionReport {
    pub fn records_stored(&self) -> usize {
        match &self.outcome {
            FileOutcome::Ingested(result) => result.records_stored,
            _ => 0,
        }
    }
}

/// Consumes upload events and loads their rows into a [`UserStore`]
///
/// Cloning is cheap; clones share the store, the task tracker and the
/// report sender.
#[derive(Clone)]
pub struct IngestionCoordinator {
    store: Arc<dyn UserStore>,
    read_timeout: Option<Duration>,
    tracker: TaskTracker,
    reports: Option<mpsc::UnboundedSender<IngestionReport>>,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn UserStore>, config: &IngestConfig) -> Self {
        info!(read_timeout = ?config.read_timeout(), "IngestionCoordinator initialized");

        Self {
            store,
            read_timeout: config.read_timeout(),
            tracker: TaskTracker::new(),
            reports: None,
        }
    }

    /// Also send every [`IngestionReport`] to the returned receiver
    pub fn with_reports(mut self) -> (Self, mpsc::UnboundedReceiver<IngestionReport>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.reports = Some(sender);
        (self, receiver)
    }

    /// Subscribe this coordinator to `channel`
    pub fn register(&self, channel: &EventChannel) -> usize {
        channel.subscribe(self.clone())
    }

    /// Spawn the unit of work for `event` and return immediately
    pub fn dispatch(&self, event: UploadEvent) {
        let coordinator = self.clone();
        let span = info_span!("ingest_file", path = %event.location.display());
        self.tracker
            .spawn(async move { coordinator.process(event).await }.instrument(span));
    }

    /// Wait until every dispatched unit of work has finished
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Run one unit of work to completion
    ///
    /// Never fails: problems are logged and reflected in the report, and the
    /// artifact is always released before returning.
    pub async fn process(&self, event: UploadEvent) -> IngestionReport {
        let path = event.location.clone();
        self.process_with(event, async move { reader::ingest_file(&path).await })
            .await
    }

    /// Run one unit of work, taking its rows from `read` instead of the file
    ///
    /// The artifact at `event.location` is still released afterwards.
    pub(crate) async fn process_with<F>(&self, event: UploadEvent, read: F) -> IngestionReport
    where
        F: Future<Output = Result<IngestionBatch>>,
    {
        let started = Instant::now();
        let artifact = TempArtifact::new(event.location);
        let location = artifact.path().to_path_buf();

        let mut state = ProcessingState::Notified;
        advance(&location, &mut state, ProcessingState::Reading);

        let outcome = match self.read(&location, read).await {
            Ok(batch) => {
                let result = self.store_batch(&location, batch);
                advance(&location, &mut state, ProcessingState::Ingested);
                FileOutcome::Ingested(result)
            },
            Err(e) if e.is_not_found() => {
                warn!(path = %location.display(), "File not found");
                FileOutcome::Missing
            },
            Err(e) => {
                error!(path = %location.display(), error = %e, "Error during file processing");
                advance(&location, &mut state, ProcessingState::ReadFailed);
                FileOutcome::ReadFailed {
                    reason: e.to_string(),
                }
            },
        };

        let deletion = artifact.release().await;
        advance(&location, &mut state, ProcessingState::Cleaned);

        let report = IngestionReport {
            location,
            outcome,
            deletion,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            finished_at: Utc::now(),
        };

        if let Some(reports) = &self.reports {
            if reports.send(report.clone()).is_err() {
                debug!("Report receiver dropped");
            }
        }

        report
    }

    /// Read and validate the artifact, catching panics and applying the timeout
    async fn read<F>(&self, path: &Path, read: F) -> Result<IngestionBatch>
    where
        F: Future<Output = Result<IngestionBatch>>,
    {
        info!(path = %path.display(), "Processing file");

        let read = AssertUnwindSafe(read).catch_unwind();
        let caught = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| BulkImportError::Timeout(limit.as_secs()))?,
            None => read.await,
        };

        caught.map_err(|panic| {
            let message = panic_message(panic.as_ref());
            BulkImportError::Parse(format!("ingestion panicked: {message}"))
        })?
    }

    fn store_batch(&self, location: &Path, batch: IngestionBatch) -> IngestionResult {
        for failure in &batch.failures {
            warn!(
                path = %location.display(),
                line = failure.line_number,
                reason = %failure.reason,
                "Validation failed"
            );
        }

        let records_stored = self.store.append(batch.records);

        info!(
            path = %location.display(),
            records_stored,
            failures = batch.failures.len(),
            total_users = self.store.len(),
            "File ingested"
        );

        IngestionResult {
            records_stored,
            failures: batch.failures,
        }
    }
}

#[async_trait]
impl EventHandler for IngestionCoordinator {
    async fn handle(&self, event: &UploadEvent) -> anyhow::Result<()> {
        self.dispatch(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "ingestion-coordinator"
    }
}

fn advance(location: &Path, state: &mut ProcessingState, next: ProcessingState) {
    debug!(path = %location.display(), from = ?*state, to = ?next, "State transition");
    *state = next;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryUserStore;
    use crate::validator::{UserField, ValidationError};

    fn coordinator() -> (IngestionCoordinator, InMemoryUserStore) {
        let store = InMemoryUserStore::new();
        let coordinator =
            IngestionCoordinator::new(Arc::new(store.clone()), &IngestConfig::default());
        (coordinator, store)
    }

    fn write_csv(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[tokio::test]
    async fn test_process_stores_valid_rows_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "upload-a.csv",
            &[
                "id,firstName,lastName,email",
                "1,Alice,Johnson,alice@example.com",
                "2,,Smith,bob@x.co",
                "3,Carl,Lee,not-an-email",
            ],
        );
        let (coordinator, store) = coordinator();

        let report = coordinator.process(UploadEvent::new(&path)).await;

        let FileOutcome::Ingested(result) = &report.outcome else {
            panic!("expected ingested outcome, got {:?}", report.outcome);
        };
        assert_eq!(result.records_stored, 1);
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].line_number, 3);
        assert_eq!(
            result.failures[0].reason,
            ValidationError::MissingField(UserField::FirstName)
        );
        assert_eq!(result.failures[1].line_number, 4);
        assert!(matches!(result.failures[1].reason, ValidationError::InvalidEmail(_)));

        assert_eq!(store.snapshot()[0].id, "1");
        assert_eq!(report.deletion, Deletion::Deleted);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_records_stored_counts_only_this_file() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = coordinator();

        let first = write_csv(dir.path(), "a.csv", &["h", "1,A,B,a@b.co", "2,C,D,c@d.co"]);
        let second = write_csv(dir.path(), "b.csv", &["h", "3,E,F,e@f.co"]);

        assert_eq!(coordinator.process(UploadEvent::new(first)).await.records_stored(), 2);
        assert_eq!(coordinator.process(UploadEvent::new(second)).await.records_stored(), 1);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = coordinator();

        let report = coordinator
            .process(UploadEvent::new(dir.path().join("vanished.csv")))
            .await;

        assert_eq!(report.outcome, FileOutcome::Missing);
        assert_eq!(report.deletion, Deletion::AlreadyAbsent);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_badly_encoded_row_does_not_drop_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin1.csv");
        let mut bytes = b"id,firstName,lastName,email\n".to_vec();
        for i in 0..100 {
            bytes.extend_from_slice(format!("{i},User{i},Test,u{i}@example.com\n").as_bytes());
        }
        bytes.extend_from_slice(b"100,Ren\xe9,Lee,r@b.co\n101,Last,Row,last@row.io\n");
        std::fs::write(&path, bytes).unwrap();
        let (coordinator, store) = coordinator();

        let report = coordinator.process(UploadEvent::new(&path)).await;

        assert_eq!(report.records_stored(), 102);
        assert_eq!(store.len(), 102);
        assert_eq!(report.deletion, Deletion::Deleted);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_io_error_is_a_read_failure() {
        // Opening a directory succeeds, reading from it does not
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = coordinator();

        let report = coordinator.process(UploadEvent::new(dir.path())).await;

        assert!(matches!(report.outcome, FileOutcome::ReadFailed { .. }));
        assert!(matches!(report.deletion, Deletion::Failed(_)));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "stalled.csv", &["id,firstName,lastName,email"]);
        let store = InMemoryUserStore::new();
        let config = IngestConfig {
            read_timeout_secs: 5,
            ..IngestConfig::default()
        };
        let coordinator = IngestionCoordinator::new(Arc::new(store.clone()), &config);

        // The writer half stays open and silent, so the read never finishes
        let (writer, stalled) = tokio::io::duplex(64);
        let read = async move {
            let _writer = writer;
            let batch = reader::ingest(tokio::io::BufReader::new(stalled)).await?;
            Ok::<_, BulkImportError>(batch)
        };
        let report = coordinator.process_with(UploadEvent::new(&path), read).await;

        let FileOutcome::ReadFailed { reason } = &report.outcome else {
            panic!("expected read failure, got {:?}", report.outcome);
        };
        assert!(reason.contains("Timed out"), "unexpected reason: {reason}");
        assert_eq!(report.deletion, Deletion::Deleted);
        assert!(!path.exists());
        assert!(store.is_empty());
    }

    async fn exploding_read() -> Result<IngestionBatch> {
        panic!("reader blew up")
    }

    #[tokio::test]
    async fn test_panic_during_read_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "boom.csv", &["id,firstName,lastName,email"]);
        let (coordinator, store) = coordinator();

        let report = coordinator
            .process_with(UploadEvent::new(&path), exploding_read())
            .await;

        let FileOutcome::ReadFailed { reason } = &report.outcome else {
            panic!("expected read failure, got {:?}", report.outcome);
        };
        assert!(reason.contains("reader blew up"), "unexpected reason: {reason}");
        assert_eq!(report.deletion, Deletion::Deleted);
        assert!(!path.exists());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_header_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(dir.path(), "header.csv", &["id,firstName,lastName,email"]);
        let (coordinator, _store) = coordinator();

        let report = coordinator.process(UploadEvent::new(&path)).await;

        assert_eq!(report.outcome, FileOutcome::Ingested(IngestionResult::default()));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reports_are_sent_for_dispatched_work() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, store) = coordinator();
        let (coordinator, mut reports) = coordinator.with_reports();

        for i in 0..5 {
            let path = write_csv(
                dir.path(),
                &format!("upload-{i}.csv"),
                &["id,firstName,lastName,email", &format!("{i},U{i},Test,u{i}@example.com")],
            );
            coordinator.dispatch(UploadEvent::new(path));
        }
        coordinator.wait_idle().await;

        let mut received = Vec::new();
        while let Ok(report) = reports.try_recv() {
            received.push(report);
        }
        assert_eq!(received.len(), 5);
        assert!(received.iter().all(|r| r.records_stored() == 1));
        assert!(received.iter().all(|r| !r.location.exists()));
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_report_serializes_outcome_tag() {
        let report = IngestionReport {
            location: PathBuf::from("/tmp/upload-x.csv"),
            outcome: FileOutcome::Missing,
            deletion: Deletion::AlreadyAbsent,
            elapsed_ms: 3,
            finished_at: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["status"], "missing");
        assert_eq!(json["deletion"]["status"], "already_absent");
        assert_eq!(json["elapsedMs"], 3);
    }
}
