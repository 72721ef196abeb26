//! Relational warehouse write protocol (§4.6): one transaction per batch
//! that upserts every row by primary key and advances the offset row in
//! the same commit. Parameterized so the same protocol backs the
//! time-series destination, which differs only in its `SchemaMapper`
//! family (§4.5: "derives by inheritance... with explicit per-key
//! overrides").

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{CdcError, Result};
use crate::mapper::SchemaMapper;
use crate::offset::{is_advance, Offset, OffsetKey};
use crate::reader::Token;
use crate::schema::{incompatible_reason, ColumnOp, SchemaChange};

use super::{Batch, RowUpsert, Sink, SinkHealth, DependencyStatus, ThroughputTracker};

/// The physical client for a relational (or time-series) warehouse. A
/// real implementation issues the parameterized SQL named in §6; tests
/// and this crate's fakes exercise the protocol against an in-memory
/// stand-in instead.
#[async_trait]
pub trait RelationalClient: Send + Sync {
    /// Executes the whole batch -- row upserts plus the offset row
    /// comparison/advance -- as one transaction. Returns whether the
    /// offset actually advanced (`false` means every row in the batch
    /// was a replay already committed; still not an error).
    async fn upsert_batch_transactional(
        &self,
        table: &str,
        rows: &[RowUpsert],
        offset_key: &OffsetKey,
        token: &Token,
        timestamp_micros: i64,
        delta_events: u64,
    ) -> Result<bool>;

    async fn apply_ddl(&self, table: &str, ops: &[ColumnOp], mapper: &SchemaMapper) -> Result<()>;

    async fn ping(&self) -> Result<Duration>;

    async fn read_offset(&self, offset_key: &OffsetKey) -> Result<Option<Offset>>;

    /// Advances the offset row alone, outside the batch transaction, for
    /// a batch that was DLQ'd instead of written (§4.7).
    async fn advance_offset_only(&self, offset_key: &OffsetKey, token: &Token, timestamp_micros: i64, delta_events: u64) -> Result<()>;
}

pub struct RelationalSink {
    destination: String,
    client: std::sync::Arc<dyn RelationalClient>,
    mapper: SchemaMapper,
    throughput: ThroughputTracker,
}

impl RelationalSink {
    pub fn new(destination: impl Into<String>, client: std::sync::Arc<dyn RelationalClient>, mapper: SchemaMapper) -> Self {
        RelationalSink { destination: destination.into(), client, mapper, throughput: ThroughputTracker::new() }
    }
}

#[async_trait]
impl Sink for RelationalSink {
    fn name(&self) -> &str {
        &self.destination
    }

    async fn connect(&self) -> Result<()> {
        self.client.ping().await.map(|_| ())
    }

    async fn write_batch(&self, batch: &Batch, token: &Token) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.throughput.begin_batch();
        let offset_key = OffsetKey::new(&batch.table, &batch.keyspace, batch.partition_id, &self.destination);
        let rows = batch.rows();
        let result = self
            .client
            .upsert_batch_transactional(&batch.table, &rows, &offset_key, token, batch.newest_timestamp_micros(), batch.events.len() as u64)
            .await;
        self.throughput.end_batch(batch.events.len() as u64);
        match &result {
            Ok(advanced) => info!(destination = %self.destination, table = %batch.table, events = batch.events.len(), advanced, "batch committed"),
            Err(e) => warn!(destination = %self.destination, table = %batch.table, error = %e, "batch write failed"),
        }
        result.map(|_| ())
    }

    async fn apply_schema_change(&self, change: &SchemaChange) -> Result<()> {
        self.client.apply_ddl(&change.table, &change.ops, &self.mapper).await
    }

    async fn health_check(&self) -> Result<SinkHealth> {
        match self.client.ping().await {
            Ok(latency) => Ok(SinkHealth { status: DependencyStatus::Healthy, latency, error: None }),
            Err(e) => Ok(SinkHealth { status: DependencyStatus::Unhealthy, latency: Duration::ZERO, error: Some(e.to_string()) }),
        }
    }

    fn throughput(&self) -> &ThroughputTracker {
        &self.throughput
    }

    async fn read_offset(&self, key: &OffsetKey) -> Result<Option<Offset>> {
        self.client.read_offset(key).await
    }

    async fn advance_offset_only(&self, key: &OffsetKey, token: &Token, timestamp_micros: i64, delta_events: u64) -> Result<()> {
        self.client.advance_offset_only(key, token, timestamp_micros, delta_events).await
    }
}

/// An in-memory `RelationalClient`, standing in for a real warehouse
/// connection in tests. A single `Mutex` stands in for the destination's
/// transactional guarantee: either both the rows and the offset move, or
/// neither does.
pub struct InMemoryRelationalClient {
    rows: DashMap<(String, String), RowUpsert>,
    offsets: DashMap<OffsetKey, Offset>,
    txn_lock: Mutex<()>,
    fail_next: std::sync::atomic::AtomicBool,
    ddl_log: Mutex<Vec<(String, Vec<ColumnOp>)>>,
    stalled: std::sync::atomic::AtomicBool,
    stall_released: Notify,
}

impl Default for InMemoryRelationalClient {
    fn default() -> Self {
        InMemoryRelationalClient {
            rows: DashMap::new(),
            offsets: DashMap::new(),
            txn_lock: Mutex::new(()),
            fail_next: std::sync::atomic::AtomicBool::new(false),
            ddl_log: Mutex::new(Vec::new()),
            stalled: std::sync::atomic::AtomicBool::new(false),
            stall_released: Notify::new(),
        }
    }
}

impl InMemoryRelationalClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: makes the next `upsert_batch_transactional` call fail
    /// transiently, simulating a brief destination hiccup.
    pub fn fail_next_write(&self) {
        self.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Test hook: blocks every subsequent `upsert_batch_transactional`
    /// call before it touches any state, simulating a sustained destination
    /// stall (§8 seed scenario 6), until `release_stall` is called.
    pub fn stall_writes(&self) {
        self.stalled.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn release_stall(&self) {
        self.stalled.store(false, std::sync::atomic::Ordering::SeqCst);
        self.stall_released.notify_waiters();
    }

    pub fn row(&self, table: &str, primary_key: &str) -> Option<RowUpsert> {
        self.rows.get(&(table.to_string(), primary_key.to_string())).map(|e| e.clone())
    }

    /// Count of distinct primary keys committed for `table`, used by
    /// integration tests to assert a final row count without needing to
    /// know every primary key up front.
    pub fn row_count(&self, table: &str) -> usize {
        self.rows.iter().filter(|e| e.key().0 == table).count()
    }

    pub fn offset(&self, key: &OffsetKey) -> Option<Offset> {
        self.offsets.get(key).map(|e| e.clone())
    }

    pub fn ddl_applied(&self) -> Vec<(String, Vec<ColumnOp>)> {
        self.ddl_log.lock().clone()
    }

    fn pk_string(pk: &crate::event::KeyMap) -> String {
        pk.iter().map(|(k, v)| format!("{k}={v:?}")).collect::<Vec<_>>().join(",")
    }
}

#[async_trait]
impl RelationalClient for InMemoryRelationalClient {
    async fn upsert_batch_transactional(
        &self,
        table: &str,
        rows: &[RowUpsert],
        offset_key: &OffsetKey,
        token: &Token,
        timestamp_micros: i64,
        delta_events: u64,
    ) -> Result<bool> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(CdcError::Transient("simulated destination hiccup".to_string()));
        }
        while self.stalled.load(std::sync::atomic::Ordering::SeqCst) {
            // `enable()` registers the waiter before re-checking the flag,
            // closing the race against a `release_stall` that runs between
            // the load above and the `.await` below.
            let notified = self.stall_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.stalled.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        let _guard = self.txn_lock.lock();
        let existing = self.offsets.get(offset_key).map(|e| e.clone());
        let advanced = is_advance(existing.as_ref(), &token.file, token.position);
        if !advanced {
            // Whole batch is a replay; do not touch rows or the offset.
            return Ok(false);
        }
        for row in rows {
            self.rows.insert((table.to_string(), Self::pk_string(&row.primary_key)), row.clone());
        }
        let events_replicated_count = existing.map(|o| o.events_replicated_count).unwrap_or(0) + delta_events;
        self.offsets.insert(
            offset_key.clone(),
            Offset {
                commitlog_file: token.file.clone(),
                commitlog_position: token.position,
                last_event_timestamp_micros: timestamp_micros,
                last_committed_at: chrono::Utc::now(),
                events_replicated_count,
            },
        );
        Ok(true)
    }

    async fn apply_ddl(&self, table: &str, ops: &[ColumnOp], _mapper: &SchemaMapper) -> Result<()> {
        if let Some((column, reason)) = incompatible_reason(ops) {
            return Err(CdcError::SchemaIncompatible { column, reason });
        }
        self.ddl_log.lock().push((table.to_string(), ops.to_vec()));
        Ok(())
    }

    async fn ping(&self) -> Result<Duration> {
        Ok(Instant::now().elapsed())
    }

    async fn read_offset(&self, offset_key: &OffsetKey) -> Result<Option<Offset>> {
        Ok(self.offsets.get(offset_key).map(|e| e.clone()))
    }

    async fn advance_offset_only(&self, offset_key: &OffsetKey, token: &Token, timestamp_micros: i64, delta_events: u64) -> Result<()> {
        let _guard = self.txn_lock.lock();
        let existing = self.offsets.get(offset_key).map(|e| e.clone());
        if !is_advance(existing.as_ref(), &token.file, token.position) {
            return Ok(());
        }
        let events_replicated_count = existing.map(|o| o.events_replicated_count).unwrap_or(0) + delta_events;
        self.offsets.insert(
            offset_key.clone(),
            Offset {
                commitlog_file: token.file.clone(),
                commitlog_position: token.position,
                last_event_timestamp_micros: timestamp_micros,
                last_committed_at: chrono::Utc::now(),
                events_replicated_count,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ColumnMap, ColumnValue, Event, EventKind};
    use crate::mapper::DestinationFamily;
    use std::sync::Arc;

    fn event(ts: i64) -> Event {
        let mut cols = ColumnMap::new();
        cols.insert("email".to_string(), ColumnValue::Text("a@b.com".to_string()));
        Event::new(
            "commitlog-0001.log",
            EventKind::Insert,
            "ks".into(),
            "users".into(),
            vec![("user_id".to_string(), ColumnValue::Int(1))],
            None,
            cols,
            ts,
            None,
            chrono::Utc::now(),
        )
        .unwrap()
    }

    fn batch(events: Vec<Event>) -> Batch {
        Batch { keyspace: "ks".to_string(), table: "users".to_string(), partition_id: 1, events }
    }

    #[tokio::test]
    async fn write_batch_commits_rows_and_advances_offset() {
        let client = Arc::new(InMemoryRelationalClient::new());
        let sink = RelationalSink::new("relational", client.clone(), SchemaMapper::new(DestinationFamily::Relational));
        let token = Token::new("commitlog-0001.log", 100);
        sink.write_batch(&batch(vec![event(1)]), &token).await.unwrap();

        assert!(client.row("users", "user_id=Int(1)").is_some());
        let offset = client.offset(&OffsetKey::new("users", "ks", 1, "relational")).unwrap();
        assert_eq!(offset.events_replicated_count, 1);
        assert_eq!(offset.commitlog_position, 100);
    }

    #[tokio::test]
    async fn replaying_the_same_batch_does_not_double_count() {
        let client = Arc::new(InMemoryRelationalClient::new());
        let sink = RelationalSink::new("relational", client.clone(), SchemaMapper::new(DestinationFamily::Relational));
        let token = Token::new("commitlog-0001.log", 100);
        sink.write_batch(&batch(vec![event(1)]), &token).await.unwrap();
        sink.write_batch(&batch(vec![event(1)]), &token).await.unwrap();

        let offset = client.offset(&OffsetKey::new("users", "ks", 1, "relational")).unwrap();
        assert_eq!(offset.events_replicated_count, 1, "replay must not double the count");
    }

    #[tokio::test]
    async fn transient_failure_leaves_prior_state_untouched() {
        let client = Arc::new(InMemoryRelationalClient::new());
        let sink = RelationalSink::new("relational", client.clone(), SchemaMapper::new(DestinationFamily::Relational));
        sink.write_batch(&batch(vec![event(1)]), &Token::new("commitlog-0001.log", 100)).await.unwrap();

        client.fail_next_write();
        let err = sink.write_batch(&batch(vec![event(2)]), &Token::new("commitlog-0001.log", 200)).await.unwrap_err();
        assert_eq!(err.category(), "Transient");
        let offset = client.offset(&OffsetKey::new("users", "ks", 1, "relational")).unwrap();
        assert_eq!(offset.commitlog_position, 100, "failed batch must not have advanced the offset");
    }
}
