//! Collection metadata sinks.
//!
//! Every finished sweep is reported to a [`CollectionSink`] (a LIMS or a local log).

use crate::error::WorkflowResult;
use crate::queue::EntryStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub proposal_id: Uuid,
    pub sweep_id: Uuid,
    /// Queue label, e.g. `sweep_2`
    pub sweep_name: String,
    pub image_dir: String,
    pub images: u32,
    pub status: EntryStatus,
    pub timestamp: DateTime<Utc>,
}

/// Consumer of collection records.
#[async_trait]
pub trait CollectionSink: Send + Sync {
    async fn record(&self, record: CollectionRecord) -> WorkflowResult<()>;
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct InMemorySink {
    records: Mutex<Vec<CollectionRecord>>,
}

impl InMemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded.
    pub fn records(&self) -> Vec<CollectionRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CollectionSink for InMemorySink {
    async fn record(&self, record: CollectionRecord) -> WorkflowResult<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}

/// Appends one JSON object per record to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    /// Sink appending to `path`; the file is created on first record.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File the records go to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CollectionSink for JsonLinesSink {
    async fn record(&self, record: CollectionRecord) -> WorkflowResult<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, images: u32) -> CollectionRecord {
        CollectionRecord {
            proposal_id: Uuid::new_v4(),
            sweep_id: Uuid::new_v4(),
            sweep_name: name.into(),
            image_dir: "/data/visitor/char".into(),
            images,
            status: EntryStatus::Success,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_sink_keeps_order() {
        let sink = InMemorySink::new();
        sink.record(record("sweep_1", 10)).await.unwrap();
        sink.record(record("sweep_2", 20)).await.unwrap();

        let names: Vec<String> = sink.records().into_iter().map(|r| r.sweep_name).collect();
        assert_eq!(names, ["sweep_1", "sweep_2"]);
    }

    #[tokio::test]
    async fn json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("collections.jsonl"));
        let first = record("sweep_1", 10);
        sink.record(first.clone()).await.unwrap();
        sink.record(record("sweep_2", 20)).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: CollectionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, first);
    }
}
