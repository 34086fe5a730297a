//! Connector contracts
//!
//! Connectors are adapters for external systems. The core only consumes
//! their read/write contracts: a source is a lazy, cancellable sequence of
//! record batches (restartable only by reconstructing the connector), a
//! destination is an at-least-once batch writer. Concrete production
//! connectors live outside this crate; the file connectors here exist for
//! local development and testing.

use std::io::{BufRead, BufReader, BufWriter, Write};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectorOperation, Error, Result};
use crate::record::{Batch, DataRecord};

/// Outcome of writing one batch to a destination
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// Whether the whole batch was committed
    pub successful: bool,

    /// Records actually written
    pub records_written: u64,

    /// Optional connector-supplied detail
    pub message: Option<String>,
}

impl WriteResult {
    /// A fully successful write of `records_written` records
    pub fn ok(records_written: u64) -> Self {
        Self {
            successful: true,
            records_written,
            message: None,
        }
    }

    /// A failed write with a connector-supplied reason
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            records_written: 0,
            message: Some(message.into()),
        }
    }
}

/// Trait for source connectors.
///
/// `read_batch` returns `None` when the source is exhausted. A source that
/// observes the cancellation token should stop early and return `None`;
/// records already returned stay counted. There is no mid-stream seek:
/// restarting means building a new connector.
#[async_trait]
pub trait SourceConnector: Send {
    /// Pull the next batch of at most `batch_size` records
    async fn read_batch(
        &mut self,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<Batch>>;
}

/// Trait for destination connectors.
///
/// At-least-once: a failed write leaves previously written batches
/// committed.
#[async_trait]
pub trait DestinationConnector: Send {
    /// Push one batch to the destination
    async fn write_batch(
        &mut self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<WriteResult>;
}

/// Resolves the connector handles named in stage configurations
pub trait ConnectorProvider: Send + Sync {
    /// Build a source connector for the given handle
    fn source(&self, handle: &str) -> Result<Box<dyn SourceConnector>>;

    /// Build a destination connector for the given handle
    fn sink(&self, handle: &str) -> Result<Box<dyn DestinationConnector>>;
}

// ============================================================================
// File Connectors (for local dev/testing)
// ============================================================================

/// JSONL file source connector
pub struct FileSourceConnector {
    path: String,
    reader: Option<BufReader<std::fs::File>>,
    row_number: u64,
}

impl FileSourceConnector {
    /// Create a new file source reading JSONL from `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reader: None,
            row_number: 0,
        }
    }

    fn ensure_reader(&mut self) -> Result<&mut BufReader<std::fs::File>> {
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => {
                let file = std::fs::File::open(&self.path).map_err(|e| Error::Connector {
                    connector: self.path.clone(),
                    operation: ConnectorOperation::Connect,
                    message: e.to_string(),
                    transient: false,
                })?;
                BufReader::new(file)
            }
        };
        Ok(self.reader.insert(reader))
    }
}

#[async_trait]
impl SourceConnector for FileSourceConnector {
    async fn read_batch(
        &mut self,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<Batch>> {
        let path = self.path.clone();
        let mut batch = Batch::new();
        let mut line = String::new();

        loop {
            if cancel.is_cancelled() || batch.len() >= batch_size {
                break;
            }
            line.clear();
            let reader = self.ensure_reader()?;
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let payload: serde_json::Value =
                serde_json::from_str(trimmed).map_err(|e| Error::Connector {
                    connector: path.clone(),
                    operation: ConnectorOperation::Read,
                    message: format!("line {}: {}", self.row_number + 1, e),
                    transient: false,
                })?;
            self.row_number += 1;
            batch.push(
                DataRecord::from_value(payload)
                    .with_row_number(self.row_number)
                    .with_source(path.clone()),
            );
        }

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

/// JSONL file destination connector
pub struct FileDestinationConnector {
    path: String,
    writer: Option<BufWriter<std::fs::File>>,
}

impl FileDestinationConnector {
    /// Create a new file destination writing JSONL to `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    fn ensure_writer(&mut self) -> Result<&mut BufWriter<std::fs::File>> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                if let Some(parent) = std::path::Path::new(&self.path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::File::create(&self.path).map_err(|e| Error::Connector {
                    connector: self.path.clone(),
                    operation: ConnectorOperation::Connect,
                    message: e.to_string(),
                    transient: false,
                })?;
                BufWriter::new(file)
            }
        };
        Ok(self.writer.insert(writer))
    }
}

#[async_trait]
impl DestinationConnector for FileDestinationConnector {
    async fn write_batch(
        &mut self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<WriteResult> {
        if cancel.is_cancelled() {
            return Ok(WriteResult::failed("cancelled"));
        }
        let writer = self.ensure_writer()?;
        for record in batch {
            let line = serde_json::to_string(&record.to_value())?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
        Ok(WriteResult::ok(batch.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_source_reads_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(
            &path,
            "{\"id\":1}\n{\"id\":2}\n\n{\"id\":3}\n", // blank line skipped
        )
        .unwrap();

        let mut source = FileSourceConnector::new(path.to_str().unwrap());
        let cancel = CancellationToken::new();

        let first = source.read_batch(2, &cancel).await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].get("id"), Some(&json!(1)));
        assert_eq!(first[0].row_number, 1);
        assert_eq!(first[1].row_number, 2);

        let second = source.read_batch(2, &cancel).await.unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].get("id"), Some(&json!(3)));

        assert!(source.read_batch(2, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_source_stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"id\":1}\n{\"id\":2}\n").unwrap();

        let mut source = FileSourceConnector::new(path.to_str().unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(source.read_batch(10, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_source_missing_file_is_connect_error() {
        let mut source = FileSourceConnector::new("/nonexistent/in.jsonl");
        let cancel = CancellationToken::new();
        let err = source.read_batch(10, &cancel).await.unwrap_err();
        match err {
            Error::Connector { operation, .. } => {
                assert_eq!(operation, ConnectorOperation::Connect)
            }
            other => panic!("Expected connector error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_file_destination_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let mut sink = FileDestinationConnector::new(path.to_str().unwrap());
        let cancel = CancellationToken::new();
        let batch = vec![
            DataRecord::from_value(json!({"x": 1})),
            DataRecord::from_value(json!({"x": 2})),
        ];
        let result = sink.write_batch(&batch, &cancel).await.unwrap();
        assert!(result.successful);
        assert_eq!(result.records_written, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["x"], 1);
    }

    #[tokio::test]
    async fn test_file_destination_refuses_after_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut sink = FileDestinationConnector::new(path.to_str().unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = sink
            .write_batch(&vec![DataRecord::new()], &cancel)
            .await
            .unwrap();
        assert!(!result.successful);
    }
}
