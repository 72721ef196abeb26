//! C7 (DLQ half) — the append-only, newline-delimited JSON log that
//! terminal and retry-exhausted events are routed to (§4.7, §6).

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::Result;
use crate::event::Event;

/// One DLQ record: a wrapper around one `Event` plus the context of why it
/// is here. Field names and layout match §6's DLQ file format exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    #[serde(rename = "dlqId")]
    pub dlq_id: Uuid,
    #[serde(rename = "originalEvent")]
    pub original_event: Event,
    pub destination: String,
    #[serde(rename = "errorCategory")]
    pub error_category: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "firstFailureAt")]
    pub first_failure_at: DateTime<Utc>,
    #[serde(rename = "dlqWrittenAt")]
    pub dlq_written_at: DateTime<Utc>,
}

/// Writes DLQ records. Writing a record is the acknowledgement of giving
/// up on that event; only after it succeeds may the orchestrator advance
/// the offset past it (§4.7). Not cancellable once begun (§5).
#[async_trait]
pub trait DlqWriter: Send + Sync {
    async fn write(&self, record: &DlqRecord) -> Result<()>;
}

/// A `DlqWriter` backed by the filesystem, partitioned by wall-clock day
/// into `failed_events_YYYY-MM-DD.jsonl` files (§6).
pub struct FileDlqWriter {
    dir: PathBuf,
}

impl FileDlqWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileDlqWriter { dir: dir.into() }
    }

    fn path_for(&self, when: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("failed_events_{}.jsonl", when.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl DlqWriter for FileDlqWriter {
    async fn write(&self, record: &DlqRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(record.dlq_written_at);
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
