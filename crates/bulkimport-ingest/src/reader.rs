//! Streaming CSV ingestor
//!
//! Reads a user CSV line by line, skipping the header, and folds every data
//! line into an [`IngestionBatch`]. A bad row becomes a [`RowFailure`] and
//! reading carries on; only I/O errors end the read early.
//!
//! # Format
//! ```text
//! id,firstName,lastName,email
//! 1,Alice,Johnson,alice@example.com
//! ```
//!
//! Fields are split on `,` with no quoting and trimmed before validation.
//! Bytes that are not valid UTF-8 are replaced with U+FFFD, so an oddly
//! encoded row is judged by the validator like any other. Lines longer than
//! [`MAX_LINE_BYTES`] are recorded as failures without being buffered whole.

use std::path::Path;

use bulkimport_common::{BulkImportError, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, trace, warn};

use crate::models::{IngestionBatch, RowFailure};
use crate::validator::{self, ValidationError};

/// Physical line number of the header
pub const HEADER_LINE: usize = 1;

/// Longest data line accepted, excluding the terminator
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Ingest every data line available from `reader`
///
/// The header is skipped without inspection. Line terminators (`\n` or
/// `\r\n`) are removed before a line is recorded.
pub async fn ingest<R>(mut reader: R) -> std::io::Result<IngestionBatch>
where
    R: AsyncBufRead + Unpin,
{
    let mut batch = IngestionBatch::default();
    let mut buf = Vec::new();
    let mut line_number = 0;

    while let Some(overflowed) = next_line(&mut reader, &mut buf).await? {
        line_number += 1;
        if line_number == HEADER_LINE {
            trace!("Skipping header line");
            continue;
        }

        let raw_line = String::from_utf8_lossy(&buf).into_owned();
        if overflowed {
            warn!(line = line_number, limit = MAX_LINE_BYTES, "Line too long, skipped");
            batch.failures.push(RowFailure {
                line_number,
                raw_line,
                reason: ValidationError::LineTooLong(MAX_LINE_BYTES),
            });
            continue;
        }
        fold_line(&mut batch, line_number, raw_line);
    }

    debug!(
        records = batch.records.len(),
        failures = batch.failures.len(),
        "Finished reading data lines"
    );

    Ok(batch)
}

/// Open `path` and ingest it
///
/// A missing file is reported as [`BulkImportError::FileNotFound`].
pub async fn ingest_file(path: &Path) -> Result<IngestionBatch> {
    let file = File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BulkImportError::FileNotFound(path.to_path_buf()),
        _ => BulkImportError::Io(e),
    })?;

    Ok(ingest(BufReader::new(file)).await?)
}

/// Read one line into `buf` without its terminator
///
/// Returns `None` at end of input, otherwise whether the line was longer
/// than [`MAX_LINE_BYTES`]. An over-long line keeps only its first
/// `MAX_LINE_BYTES` bytes; the rest is consumed and dropped.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    // Room for the content plus a `\r\n` terminator
    const LIMIT: usize = MAX_LINE_BYTES + 2;

    buf.clear();
    let mut started = false;
    let mut dropped = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        started = true;

        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let room = LIMIT.saturating_sub(buf.len());
        let kept = chunk.len().min(room);
        buf.extend_from_slice(&chunk[..kept]);
        dropped |= kept < chunk.len();

        let used = chunk.len();
        reader.consume(used);
        if complete {
            break;
        }
    }

    if !started {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }

    let overflowed = dropped || buf.len() > MAX_LINE_BYTES;
    buf.truncate(MAX_LINE_BYTES);
    Ok(Some(overflowed))
}

fn fold_line(batch: &mut IngestionBatch, line_number: usize, raw_line: String) {
    let outcome = {
        let fields: Vec<&str> = raw_line.split(',').map(str::trim).collect();
        validator::validate(&fields)
    };

    match outcome {
        Ok(record) => batch.records.push(record),
        Err(reason) => batch.failures.push(RowFailure {
            line_number,
            raw_line,
            reason,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::validator::{UserField, ValidationError};
    use std::io::Write;

    async fn ingest_str(content: &str) -> IngestionBatch {
        ingest(content.as_bytes()).await.unwrap()
    }

    #[tokio::test]
    async fn test_mixed_rows() {
        let batch = ingest_str(
            "id,firstName,lastName,email\n\
             1,Alice,Johnson,alice@example.com\n\
             2,,Smith,bob@x.co\n\
             3,Carl,Lee,not-an-email\n",
        )
        .await;

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, "1");

        assert_eq!(batch.failures.len(), 2);
        assert_eq!(batch.failures[0].line_number, 3);
        assert_eq!(
            batch.failures[0].reason,
            ValidationError::MissingField(UserField::FirstName)
        );
        assert_eq!(batch.failures[1].line_number, 4);
        assert_eq!(
            batch.failures[1].reason,
            ValidationError::InvalidEmail("not-an-email".to_string())
        );
    }

    #[tokio::test]
    async fn test_header_only_and_empty_input() {
        let batch = ingest_str("id,firstName,lastName,email\n").await;
        assert_eq!(batch, IngestionBatch::default());

        let batch = ingest_str("").await;
        assert_eq!(batch, IngestionBatch::default());
    }

    #[tokio::test]
    async fn test_header_is_never_validated() {
        // A header that would itself pass validation is still skipped
        let batch = ingest_str("0,Head,Er,head@er.com\n1,Alice,Johnson,alice@example.com").await;
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, "1");
    }

    #[tokio::test]
    async fn test_raw_line_is_untrimmed() {
        let batch = ingest_str("id,firstName,lastName,email\n  4 , Dana ,  \n").await;
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].raw_line, "  4 , Dana ,  ");
        assert_eq!(batch.failures[0].reason, ValidationError::InsufficientColumns(3));
    }

    #[tokio::test]
    async fn test_fields_are_trimmed() {
        let batch = ingest_str("h\r\n 5 , Eve , Adams , eve@adams.dev \r\n").await;
        assert!(batch.failures.is_empty());
        let record = &batch.records[0];
        assert_eq!(record.id, "5");
        assert_eq!(record.first_name, "Eve");
        assert_eq!(record.last_name, "Adams");
        assert_eq!(record.email, "eve@adams.dev");
    }

    #[tokio::test]
    async fn test_blank_line_is_a_failure_not_an_abort() {
        let batch = ingest_str("h\n\n6,Fay,Wu,fay@wu.net\n").await;
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].line_number, 2);
        assert_eq!(batch.failures[0].reason, ValidationError::InsufficientColumns(1));
    }

    #[tokio::test]
    async fn test_failure_line_numbers_track_physical_lines() {
        let mut content = String::from("id,firstName,lastName,email\n");
        for i in 0..50 {
            if i % 5 == 0 {
                content.push_str(&format!("{i},,Nobody,n{i}@example.com\n"));
            } else {
                content.push_str(&format!("{i},User{i},Test,u{i}@example.com\n"));
            }
        }

        let batch = ingest_str(&content).await;
        assert_eq!(batch.records.len(), 40);
        assert_eq!(batch.failures.len(), 10);
        assert_eq!(batch.rows_seen(), 50);

        let lines: Vec<usize> = batch.failures.iter().map(|f| f.line_number).collect();
        let expected: Vec<usize> = (0..50).filter(|i| i % 5 == 0).map(|i| i + 2).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn test_ingest_file_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,firstName,lastName,email").unwrap();
        writeln!(file, "1,Alice,Johnson,alice@example.com").unwrap();
        writeln!(file, "2,Bob,Smith,bob.smith@example.com").unwrap();
        file.flush().unwrap();

        let batch = ingest_file(file.path()).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert!(batch.failures.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = ingest_file(&dir.path().join("gone.csv")).await.unwrap_err();
        assert!(matches!(err, BulkImportError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_only_affects_its_own_row() {
        let mut bytes = b"id,firstName,lastName,email\n".to_vec();
        for i in 0..100 {
            bytes.extend_from_slice(format!("{i},User{i},Test,u{i}@example.com\n").as_bytes());
        }
        bytes.extend_from_slice(b"100,Ren\xe9,Lee,r@b.co\n");
        bytes.extend_from_slice(b"101,\xff\xfe,Lee,a@b.co\n");
        bytes.extend_from_slice(b"102,Last,Row,last@row.io");

        let batch = ingest(&bytes[..]).await.unwrap();

        assert_eq!(batch.records.len(), 103);
        assert!(batch.failures.is_empty());
        assert_eq!(batch.records[100].first_name, "Ren\u{FFFD}");
        assert_eq!(batch.records[102].id, "102");
    }

    #[tokio::test]
    async fn test_over_long_line_is_a_row_failure() {
        let mut content = String::from("id,firstName,lastName,email\n");
        content.push_str("1,");
        content.push_str(&"x".repeat(MAX_LINE_BYTES * 2));
        content.push_str(",Lee,a@b.co\n");
        content.push_str("2,Bob,Smith,bob.smith@example.com\n");

        // A small buffer forces the long line across many fill_buf calls
        let batch = ingest(BufReader::with_capacity(512, content.as_bytes())).await.unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, "2");
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].line_number, 2);
        assert_eq!(batch.failures[0].raw_line.len(), MAX_LINE_BYTES);
        assert_eq!(
            batch.failures[0].reason,
            ValidationError::LineTooLong(MAX_LINE_BYTES)
        );
    }

    #[tokio::test]
    async fn test_line_at_the_limit_is_validated() {
        let email = "a@b.co";
        let name = "y".repeat(MAX_LINE_BYTES - "1,,Lee,".len() - email.len());
        let line = format!("1,{name},Lee,{email}");
        assert_eq!(line.len(), MAX_LINE_BYTES);

        let content = format!("h\r\n{line}\r\n");
        let batch = ingest(BufReader::with_capacity(100, content.as_bytes())).await.unwrap();

        assert!(batch.failures.is_empty());
        assert_eq!(batch.records[0].first_name, name);
    }

    #[tokio::test]
    async fn test_read_error_ends_the_read() {
        let dir = tempfile::tempdir().unwrap();
        let err = ingest_file(dir.path()).await.unwrap_err();
        assert!(matches!(err, BulkImportError::Io(_)));
    }
}
