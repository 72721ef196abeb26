//! Per-destination worker loop: drains one partition-hashed queue slot,
//! batches contiguous events from the same partition, and drives each
//! batch through the retry wrapper (C7) before either committing or
//! DLQ'ing every event in the batch (§4.6, §4.7, §4.9).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::error;
use uuid::Uuid;

use crate::config::Config;
use crate::dlq::{DlqRecord, DlqWriter};
use crate::error::FatalSignal;
use crate::event::{Event, KeyMap};
use crate::metrics::MetricsRegistry;
use crate::offset::OffsetKey;
use crate::reader::Token;
use crate::retry::{run_with_retry, RetryOutcome};
use crate::sink::{Batch, Sink};

/// One unit of work handed from the transform stage to a destination's
/// worker slot: a masked, validated event plus its resumption token and
/// a handle on the (destination, table) in-flight counter the
/// schema-change quiesce logic watches (§4.9).
pub struct WorkItem {
    pub event: Event,
    pub token: Token,
    pub in_flight: Arc<AtomicI64>,
}

/// Everything one worker task needs, independent of the others.
pub struct WorkerContext {
    pub destination: String,
    pub slot: usize,
    pub sink: Arc<dyn Sink>,
    pub config: Config,
    pub dlq: Arc<dyn DlqWriter>,
    pub metrics: Arc<MetricsRegistry>,
    pub quarantine: Arc<DashMap<(String, String), super::QuarantineEntry>>,
    pub in_flight_by_table: Arc<DashMap<String, Arc<AtomicI64>>>,
    pub cancel: watch::Receiver<bool>,
    pub fatal: FatalSignal,
}

/// A numeric stand-in for the partition the offset table keys on (§6).
/// Distinct from `worker_slot`'s hash in `mod.rs`, which maps a key to a
/// worker index rather than an identifier for the partition itself.
fn partition_id_of(partition_key: &KeyMap) -> i64 {
    let mut hasher = DefaultHasher::new();
    for (k, v) in partition_key {
        k.hash(&mut hasher);
        v.canonical_bytes().hash(&mut hasher);
    }
    (hasher.finish() as i64).unsigned_abs() as i64
}

fn estimate_event_bytes(event: &Event) -> usize {
    event.columns.iter().map(|(k, v)| k.len() + v.canonical_bytes().len()).sum::<usize>() + 64
}

/// Events accumulating into the next batch for one worker slot. A batch
/// is always "a contiguous run of events from one partition" (§4.6): a
/// change of keyspace/table/partition forces a flush of whatever was
/// pending before the new event is accepted.
struct PendingBatch {
    keyspace: String,
    table: String,
    partition_id: i64,
    events: Vec<Event>,
    in_flight_counters: Vec<Arc<AtomicI64>>,
    newest_token: Token,
    newest_timestamp_micros: i64,
    approx_bytes: usize,
}

impl PendingBatch {
    fn new(item: WorkItem) -> Self {
        let partition_id = partition_id_of(&item.event.partition_key);
        PendingBatch {
            keyspace: item.event.keyspace.clone(),
            table: item.event.table.clone(),
            partition_id,
            newest_token: item.token,
            newest_timestamp_micros: item.event.source_timestamp_micros,
            approx_bytes: estimate_event_bytes(&item.event),
            events: vec![item.event],
            in_flight_counters: vec![item.in_flight],
        }
    }

    fn matches(&self, event: &Event) -> bool {
        self.keyspace == event.keyspace && self.table == event.table && self.partition_id == partition_id_of(&event.partition_key)
    }

    fn push(&mut self, item: WorkItem) {
        self.approx_bytes += estimate_event_bytes(&item.event);
        self.newest_token = item.token;
        self.newest_timestamp_micros = item.event.source_timestamp_micros;
        self.events.push(item.event);
        self.in_flight_counters.push(item.in_flight);
    }

    fn to_batch(&self) -> Batch {
        Batch { keyspace: self.keyspace.clone(), table: self.table.clone(), partition_id: self.partition_id, events: self.events.clone() }
    }

    fn is_full(&self, cfg: &Config) -> bool {
        self.events.len() >= cfg.batch_size || self.approx_bytes >= cfg.max_batch_bytes
    }
}

/// Drains `rx`, grouping contiguous same-partition events into batches
/// bounded by `(maxBatchSize, maxBatchBytes, maxBatchAgeMs)` (§4.6), and
/// drives each completed batch through the retry wrapper. Returns once
/// the channel closes (the orchestrator's shutdown drops the senders),
/// having flushed whatever was still pending.
pub async fn run_worker(ctx: WorkerContext, mut rx: mpsc::Receiver<WorkItem>) {
    let mut pending: Option<PendingBatch> = None;
    let idle_duration = Duration::from_secs(3600);
    let timer = tokio::time::sleep(idle_duration);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;

            maybe_item = rx.recv() => {
                match maybe_item {
                    Some(item) => {
                        if let Some(p) = &pending {
                            if !p.matches(&item.event) {
                                if let Some(batch) = pending.take() {
                                    flush(&ctx, batch).await;
                                }
                            }
                        }
                        let opening = pending.is_none();
                        match &mut pending {
                            Some(p) => p.push(item),
                            None => pending = Some(PendingBatch::new(item)),
                        }
                        if opening {
                            timer.as_mut().reset(Instant::now() + ctx.config.max_batch_age);
                        }
                        if pending.as_ref().map(|p| p.is_full(&ctx.config)).unwrap_or(false) {
                            if let Some(batch) = pending.take() {
                                flush(&ctx, batch).await;
                            }
                            timer.as_mut().reset(Instant::now() + idle_duration);
                        }
                    }
                    None => {
                        if let Some(batch) = pending.take() {
                            flush(&ctx, batch).await;
                        }
                        return;
                    }
                }
            }

            _ = &mut timer, if pending.is_some() => {
                if let Some(batch) = pending.take() {
                    flush(&ctx, batch).await;
                }
                timer.as_mut().reset(Instant::now() + idle_duration);
            }
        }
    }
}

/// Commits or DLQs one completed batch, then releases the in-flight
/// counters the quiesce logic in `mod.rs` watches to know when a table
/// has drained.
async fn flush(ctx: &WorkerContext, pending: PendingBatch) {
    let table = pending.table.clone();

    if let Some(entry) = ctx.quarantine.get(&(ctx.destination.clone(), table.clone())) {
        let entry = entry.clone();
        write_dlq_for_batch(ctx, &pending, &entry.category, &entry.reason, 0, &ctx.fatal).await;
        release(&pending);
        return;
    }

    let batch = pending.to_batch();
    let token = pending.newest_token.clone();
    let sink = ctx.sink.clone();
    let retry_cfg = ctx.config.retry.clone();
    let mut cancel = ctx.cancel.clone();

    let outcome = run_with_retry(
        &retry_cfg,
        &mut cancel,
        |_attempt| {
            let sink = sink.clone();
            let batch = batch.clone();
            let token = token.clone();
            async move { sink.write_batch(&batch, &token).await }
        },
    )
    .await;

    match outcome {
        RetryOutcome::Committed(()) => {
            ctx.metrics.inc_events_processed(&ctx.destination, &table, pending.events.len() as u64);
            let lag = (Utc::now().timestamp_micros() - pending.newest_timestamp_micros).max(0) as f64 / 1_000_000.0;
            ctx.metrics.set_replication_lag_seconds(&ctx.destination, lag);
            ctx.metrics.set_events_per_second(&ctx.destination, ctx.sink.throughput().events_per_second());
            ctx.metrics.set_backlog_depth(&ctx.destination, ctx.sink.throughput().in_flight_batches());
        }
        RetryOutcome::GiveUp(err, attempts) => {
            ctx.metrics.inc_errors(&ctx.destination, err.category());
            ctx.metrics.inc_retry_attempts(&ctx.destination);
            write_dlq_for_batch(ctx, &pending, err.category(), &err.to_string(), attempts, &ctx.fatal).await;

            // The DLQ write is the acknowledgement of giving up on this
            // batch; only once every event in it is durably recorded
            // there may the offset advance past it (§4.7, §4.8).
            let offset_key = OffsetKey::new(&table, &pending.keyspace, pending.partition_id, &ctx.destination);
            if let Err(e) = ctx
                .sink
                .advance_offset_only(&offset_key, &token, pending.newest_timestamp_micros, pending.events.len() as u64)
                .await
            {
                error!(
                    destination = %ctx.destination,
                    table = %table,
                    error = %e,
                    "fatal: could not advance offset past a dlq'd batch; refusing to proceed would risk replaying already-dlq'd events"
                );
            }
        }
    }

    release(&pending);
}

fn release(pending: &PendingBatch) {
    for counter in &pending.in_flight_counters {
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn write_dlq_for_batch(ctx: &WorkerContext, pending: &PendingBatch, category: &str, message: &str, retry_count: u32, fatal: &FatalSignal) {
    for event in &pending.events {
        write_dlq_direct(&ctx.dlq, &ctx.metrics, &ctx.destination, event, category, message, retry_count, fatal).await;
    }
}

/// Writes one event directly to the DLQ, outside the batching worker
/// loop. Used both by a worker's give-up path above and by the
/// transform stage in `mod.rs` for pre-write rejections (quarantine,
/// validator failures) that never make it into a batch at all -- those
/// callers pass `retry_count: 0` since the event never entered `run_with_retry`.
pub async fn write_dlq_direct(
    dlq: &Arc<dyn DlqWriter>,
    metrics: &MetricsRegistry,
    destination: &str,
    event: &Event,
    category: &str,
    message: &str,
    retry_count: u32,
    fatal: &FatalSignal,
) {
    let now = Utc::now();
    let record = DlqRecord {
        dlq_id: Uuid::new_v4(),
        original_event: event.clone(),
        destination: destination.to_string(),
        error_category: category.to_string(),
        error_message: message.to_string(),
        retry_count,
        first_failure_at: now,
        dlq_written_at: now,
    };
    match dlq.write(&record).await {
        Ok(()) => metrics.inc_dlq_events(destination, category),
        Err(e) => {
            // Per §5: the DLQ write itself is not cancellable and must
            // complete to preserve the exactly-once-or-in-DLQ invariant.
            // A failure here is `Fatal`: logged critically, offset not
            // advanced, so the event is replayed on the next run rather
            // than silently lost.
            error!(destination, event_id = %event.id, error = %e, "fatal: dlq write failed");
            fatal.trip();
        }
    }
}
