//! C6 — the sink interface and its per-destination write protocols
//! (§4.6). A `Sink` batches, writes idempotently, applies schema-change
//! DDL, and reports health; the physical network client for each
//! destination family is an injected `DestinationClient`-family trait
//! (the collaborator `spec.md` §1 places outside the core).

pub mod columnar;
pub mod relational;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::event::{ColumnMap, Event, KeyMap};
use crate::offset::{Offset, OffsetKey};
use crate::reader::Token;
use crate::schema::SchemaChange;

pub use columnar::ColumnarSink;
pub use relational::RelationalSink;

/// One row to upsert: primary key plus the (already masked, already
/// validated) column values.
#[derive(Debug, Clone)]
pub struct RowUpsert {
    pub primary_key: KeyMap,
    pub columns: ColumnMap,
    pub version: i64,
}

impl RowUpsert {
    pub fn from_event(event: &Event) -> Self {
        RowUpsert { primary_key: event.primary_key(), columns: event.columns.clone(), version: event.source_timestamp_micros }
    }
}

/// A contiguous run of events from one partition, bounded by
/// `(maxBatchSize, maxBatchBytes, maxBatchAgeMs)` (§4.6). Orderings
/// across partitions may interleave; within one partition they are
/// strict, which is why a batch never spans partitions.
#[derive(Debug, Clone)]
pub struct Batch {
    pub keyspace: String,
    pub table: String,
    pub partition_id: i64,
    pub events: Vec<Event>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The resumption token immediately after the batch's last event.
    /// `file`/`position` are supplied by the caller, which tracked them
    /// alongside each event as it flowed through `Qparse`.
    pub fn newest_token(&self, tokens_by_event: &[(uuid::Uuid, Token)]) -> Option<Token> {
        let last = self.events.last()?;
        tokens_by_event.iter().find(|(id, _)| *id == last.id).map(|(_, t)| t.clone())
    }

    pub fn newest_timestamp_micros(&self) -> i64 {
        self.events.last().map(|e| e.source_timestamp_micros).unwrap_or(0)
    }

    pub fn rows(&self) -> Vec<RowUpsert> {
        self.events.iter().map(RowUpsert::from_event).collect()
    }
}

/// Health as reported by one sink's dependency check (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct SinkHealth {
    pub status: DependencyStatus,
    pub latency: Duration,
    pub error: Option<String>,
}

/// A moving-average events/sec counter plus an in-flight batch count,
/// feeding backpressure decisions and the metrics surface (§4.6, §4.9).
pub struct ThroughputTracker {
    events_total: AtomicU64,
    started_at: Instant,
    in_flight: AtomicU64,
    window: Mutex<Vec<(Instant, u64)>>,
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        ThroughputTracker { events_total: AtomicU64::new(0), started_at: Instant::now(), in_flight: AtomicU64::new(0), window: Mutex::new(Vec::new()) }
    }
}

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(30);

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_batch(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_batch(&self, events: u64) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events_total.fetch_add(events, Ordering::SeqCst);
        let now = Instant::now();
        let mut w = self.window.lock();
        w.push((now, events));
        w.retain(|(t, _)| now.duration_since(*t) <= THROUGHPUT_WINDOW);
    }

    pub fn in_flight_batches(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn total_events(&self) -> u64 {
        self.events_total.load(Ordering::SeqCst)
    }

    /// Moving-average events/sec over the trailing window, or over the
    /// tracker's lifetime if it has not run for a full window yet.
    pub fn events_per_second(&self) -> f64 {
        let w = self.window.lock();
        if w.is_empty() {
            return 0.0;
        }
        let sum: u64 = w.iter().map(|(_, n)| n).sum();
        let elapsed = Instant::now().duration_since(self.started_at).as_secs_f64().max(1.0);
        let span = elapsed.min(THROUGHPUT_WINDOW.as_secs_f64()).max(1.0);
        sum as f64 / span
    }
}

/// The operations every destination implements, per §4.6. All are
/// idempotent at the (event-id, primary-key) granularity.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Writes one batch and advances its offset per the destination's
    /// protocol. A failure leaves the destination's prior committed
    /// state untouched (relational: transaction rollback; columnar: the
    /// data insert may have landed but the offset did not advance, which
    /// is safe because the merge engine deduplicates by primary key).
    async fn write_batch(&self, batch: &Batch, token: &Token) -> Result<()>;

    async fn apply_schema_change(&self, change: &SchemaChange) -> Result<()>;

    async fn health_check(&self) -> Result<SinkHealth>;

    fn throughput(&self) -> &ThroughputTracker;

    /// Reads this destination's currently converged offset for `key`,
    /// used to compute a safe resume token on startup (§4.8).
    async fn read_offset(&self, key: &OffsetKey) -> Result<Option<Offset>>;

    /// Advances the offset for a batch that was given up on (DLQ'd)
    /// rather than written. Per §4.7, the DLQ write is the
    /// acknowledgement; only after it succeeds may the offset move past
    /// the batch, so the orchestrator calls this only once the DLQ write
    /// for every event in the batch has returned successfully.
    async fn advance_offset_only(&self, key: &OffsetKey, token: &Token, timestamp_micros: i64, delta_events: u64) -> Result<()>;
}
