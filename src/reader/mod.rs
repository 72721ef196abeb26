//! C2 — tails the source's commit-log directory and decodes binary frames
//! into `Event`s, emitting a restartable `(Event, Token)` stream.

pub mod frame;
pub mod token;

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::event::Event;
pub use token::Token;

use frame::{decode_frame, DecodeOutcome};

/// One item the reader hands to the orchestrator's `Qparse`.
#[derive(Debug)]
pub enum ReaderEvent {
    Mutation(Event, Token),
    Skip { file: String, position: u64, reason: String },
}

pub struct CommitLogReader {
    dir: PathBuf,
    poll_interval: Duration,
}

impl CommitLogReader {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        CommitLogReader { dir: dir.into(), poll_interval }
    }

    /// Lists commit-log files in the directory, sorted in the order they
    /// were written (lexicographic filename order, the same convention the
    /// source's commit-log segment naming follows).
    async fn list_files(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Spawns the tailing task. Returns immediately; decoded events and
    /// parse skips are delivered on `tx` until `cancel` is signalled.
    pub fn spawn(
        self,
        start_token: Option<Token>,
        tx: mpsc::Sender<ReaderEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(start_token, &tx, &mut cancel).await {
                warn!(error = %e, "commit-log reader stopped");
            }
        })
    }

    async fn run(
        &self,
        start_token: Option<Token>,
        tx: &mpsc::Sender<ReaderEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let mut current_file: Option<String>;
        let mut current_pos: u64;
        match start_token {
            Some(t) => {
                current_file = Some(t.file);
                current_pos = t.position;
            }
            None => {
                current_file = None;
                current_pos = 0;
            }
        }

        let mut buf = BytesMut::new();

        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            let files = self.list_files().await?;
            if files.is_empty() {
                if self.wait_or_cancel(cancel).await {
                    return Ok(());
                }
                continue;
            }

            // With no token yet, resume from the oldest file still present.
            let file = match &current_file {
                Some(f) if files.iter().any(|x| x == f) => f.clone(),
                _ => {
                    current_pos = 0;
                    buf.clear();
                    files[0].clone()
                }
            };

            let is_newest = files.last().map(|f| f == &file).unwrap_or(false);
            let advanced = self.drain_file(&file, &mut current_pos, &mut buf, tx, cancel).await?;
            if *cancel.borrow() {
                return Ok(());
            }

            if !advanced && !is_newest {
                // Fully drained a sealed, non-newest file: move on.
                if let Some(next) = files.iter().find(|f| f.as_str() > file.as_str()) {
                    current_file = Some(next.clone());
                    current_pos = 0;
                    buf.clear();
                    continue;
                }
            }
            current_file = Some(file);

            if is_newest {
                if self.wait_or_cancel(cancel).await {
                    return Ok(());
                }
            }
        }
    }

    async fn wait_or_cancel(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => false,
            _ = cancel.changed() => *cancel.borrow(),
        }
    }

    /// Reads whatever new bytes are available in `file` starting at
    /// `*pos`, decoding and emitting as many frames as possible. Returns
    /// whether any bytes were consumed this round.
    async fn drain_file(
        &self,
        file: &str,
        pos: &mut u64,
        buf: &mut BytesMut,
        tx: &mpsc::Sender<ReaderEvent>,
        cancel: &mut watch::Receiver<bool>,
    ) -> std::io::Result<bool> {
        let path: &Path = self.dir.as_path();
        let full = path.join(file);
        let mut f = match File::open(&full).await {
            Ok(f) => f,
            Err(_) => return Ok(false),
        };
        f.seek(std::io::SeekFrom::Start(*pos)).await?;

        let mut chunk = vec![0u8; 64 * 1024];
        let n = f.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut consumed_any = false;
        loop {
            if *cancel.borrow() {
                return Ok(consumed_any);
            }
            match decode_frame(buf) {
                DecodeOutcome::Incomplete => break,
                DecodeOutcome::Frame { mutation, consumed } => {
                    let token = Token::new(file.to_string(), *pos + consumed);
                    let event = Event::new(
                        file,
                        mutation.kind,
                        mutation.keyspace.clone(),
                        mutation.table.clone(),
                        mutation.partition_key.clone(),
                        mutation.clustering_key.clone(),
                        mutation.columns.clone(),
                        mutation.source_timestamp_micros,
                        mutation.ttl_seconds,
                        chrono::Utc::now(),
                    );
                    match event {
                        Ok(event) => {
                            debug!(file, position = token.position, "decoded event");
                            if tx.send(ReaderEvent::Mutation(event, token)).await.is_err() {
                                return Ok(consumed_any);
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .send(ReaderEvent::Skip { file: file.to_string(), position: *pos, reason: e.to_string() })
                                .await;
                        }
                    }
                    *pos += consumed;
                    let _ = buf.split_to(consumed as usize);
                    consumed_any = true;
                }
                DecodeOutcome::Skip { reason, consumed } => {
                    let _ = tx.send(ReaderEvent::Skip { file: file.to_string(), position: *pos, reason }).await;
                    *pos += consumed;
                    let _ = buf.split_to(consumed as usize);
                    consumed_any = true;
                }
            }
        }
        Ok(consumed_any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnValue, EventKind};
    use frame::{encode_frame, RawMutation};
    use std::collections::BTreeMap;
    use tokio::io::AsyncWriteExt;

    fn mutation(ts: i64) -> RawMutation {
        let mut columns = BTreeMap::new();
        columns.insert("email".to_string(), ColumnValue::Text("a@b.com".to_string()));
        RawMutation {
            kind: EventKind::Insert,
            keyspace: "ks".to_string(),
            table: "users".to_string(),
            partition_key: vec![("user_id".to_string(), ColumnValue::Int(1))],
            clustering_key: None,
            columns,
            source_timestamp_micros: ts,
            ttl_seconds: None,
        }
    }

    #[tokio::test]
    async fn tails_a_file_and_resumes_from_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commitlog-0001.log");
        {
            let mut f = File::create(&path).await.unwrap();
            f.write_all(&encode_frame(&mutation(1))).await.unwrap();
            f.write_all(&encode_frame(&mutation(2))).await.unwrap();
            f.flush().await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let reader = CommitLogReader::new(dir.path(), Duration::from_millis(20));
        let handle = reader.spawn(None, tx, cancel_rx);

        let mut tokens = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                ReaderEvent::Mutation(e, t) => {
                    assert_eq!(e.table, "users");
                    tokens.push(t);
                }
                ReaderEvent::Skip { .. } => panic!("unexpected skip"),
            }
        }
        assert!(tokens[0] < tokens[1]);
        handle.abort();
    }
}
