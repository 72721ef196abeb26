//! C9 — composes the reader (C2), masking (C4), validator/mapper (C5),
//! and sinks (C6) into one pipeline with per-destination fan-out,
//! bounded queues, backpressure, schema-change quiescing, and graceful
//! shutdown (§4.9).

mod worker;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dlq::DlqWriter;
use crate::event::{Event, KeyMap};
use crate::mapper::{DestinationFamily, SchemaMapper};
use crate::masking::MaskingTransform;
use crate::metrics::MetricsRegistry;
use crate::reader::{ReaderEvent, Token};
use crate::schema::{SchemaCache, SchemaChange};
use crate::sink::Sink;
use crate::validator::Validator;

pub use worker::WorkItem;

/// What a quarantined `(destination, table)` pair is latched with: the
/// error category every subsequent DLQ'd event for it should carry (§8
/// seed scenario 5 expects `errorCategory="SchemaIncompatible"`, not a
/// generic quarantine label), plus the human-readable reason.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub category: String,
    pub reason: String,
}

/// Wall-clock bound on waiting for a destination's queue to drain of a
/// quiesced table's events, used to detect a wedged sink (§4.9, §5).
const QUIESCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// One configured destination: its sink, the destination family its
/// mapper belongs to (for the validator, which needs its own mapper
/// instance independent of the one the sink holds internally), and how
/// many worker slots it gets.
pub struct Destination {
    pub name: String,
    pub family: DestinationFamily,
    pub sink: Arc<dyn Sink>,
    pub workers: usize,
}

/// Stable hash of a partition key into one of `workers` slots. The same
/// partition key always lands on the same slot for a given `workers`
/// count, which is what lets the orchestrator preserve per-partition
/// order without a global lock (§9).
pub fn worker_slot(partition_key: &KeyMap, workers: usize) -> usize {
    let workers = workers.max(1);
    let mut hasher = DefaultHasher::new();
    for (k, v) in partition_key {
        k.hash(&mut hasher);
        v.canonical_bytes().hash(&mut hasher);
    }
    (hasher.finish() as usize) % workers
}

struct DestinationRuntime {
    name: String,
    queues: Vec<mpsc::Sender<WorkItem>>,
    in_flight_by_table: Arc<DashMap<String, Arc<AtomicI64>>>,
}

impl DestinationRuntime {
    fn in_flight_counter(&self, table: &str) -> Arc<AtomicI64> {
        self.in_flight_by_table.entry(table.to_string()).or_insert_with(|| Arc::new(AtomicI64::new(0))).clone()
    }
}

pub struct PipelineOrchestrator {
    config: Config,
    masking: Arc<MaskingTransform>,
    schema_cache: Arc<SchemaCache>,
    dlq: Arc<dyn DlqWriter>,
    metrics: Arc<MetricsRegistry>,
    /// Per (destination, table) latch blocking further writes until an
    /// operator clears it, set when `applySchemaChange` fails (§4.6, §7).
    quarantine: Arc<DashMap<(String, String), QuarantineEntry>>,
    /// Tables currently quiesced for a schema-change application; the
    /// transform stage stops enqueueing new events for them (§4.9).
    paused_tables: Arc<DashMap<String, ()>>,
    destinations: Vec<Destination>,
    fatal: crate::error::FatalSignal,
}

impl PipelineOrchestrator {
    pub fn new(
        config: Config,
        masking: MaskingTransform,
        schema_cache: Arc<SchemaCache>,
        dlq: Arc<dyn DlqWriter>,
        metrics: Arc<MetricsRegistry>,
        destinations: Vec<Destination>,
    ) -> Self {
        PipelineOrchestrator {
            config,
            masking: Arc::new(masking),
            schema_cache,
            dlq,
            metrics,
            quarantine: Arc::new(DashMap::new()),
            paused_tables: Arc::new(DashMap::new()),
            destinations,
            fatal: crate::error::FatalSignal::new(),
        }
    }

    pub fn quarantine_reason(&self, destination: &str, table: &str) -> Option<String> {
        self.quarantine.get(&(destination.to_string(), table.to_string())).map(|e| e.reason.clone())
    }

    /// A clone of the process-wide fatal latch, tripped if a DLQ write
    /// ever fails (§5, §7). `main.rs` holds one of these alongside the
    /// orchestrator to map that halt onto the reserved exit code.
    pub fn fatal_signal(&self) -> crate::error::FatalSignal {
        self.fatal.clone()
    }

    /// Tables currently latched in quarantine for `destination`, used by
    /// the health surface to report `degraded` with the affected tables
    /// named (§6, §7).
    pub fn quarantined_tables(&self, destination: &str) -> Vec<String> {
        self.quarantine.iter().filter(|e| e.key().0 == destination).map(|e| e.key().1.clone()).collect()
    }

    pub fn sinks(&self) -> impl Iterator<Item = (&str, &Arc<dyn Sink>)> {
        self.destinations.iter().map(|d| (d.name.as_str(), &d.sink))
    }

    /// Runs the pipeline until `cancel` is signalled, then drains
    /// in-flight work under `shutdownDeadlineMs` before returning
    /// (§4.9's two-phase shutdown). Idempotent: a second call after the
    /// first returns is a no-op because `reader_rx`/worker channels are
    /// already closed.
    pub async fn run(
        &self,
        mut reader_rx: mpsc::Receiver<ReaderEvent>,
        mut schema_change_rx: mpsc::Receiver<SchemaChange>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let runtimes: Vec<DestinationRuntime> = self
            .destinations
            .iter()
            .map(|d| {
                let capacity = self.config.max_inflight_batches_per_destination * self.config.batch_size;
                let in_flight_by_table: Arc<DashMap<String, Arc<AtomicI64>>> = Arc::new(DashMap::new());
                let mut queues = Vec::with_capacity(d.workers);
                for slot in 0..d.workers.max(1) {
                    let (tx, rx) = mpsc::channel(capacity.max(1));
                    queues.push(tx);
                    let ctx = worker::WorkerContext {
                        destination: d.name.clone(),
                        slot,
                        sink: d.sink.clone(),
                        config: self.config.clone(),
                        dlq: self.dlq.clone(),
                        metrics: self.metrics.clone(),
                        quarantine: self.quarantine.clone(),
                        in_flight_by_table: in_flight_by_table.clone(),
                        cancel: cancel.clone(),
                        fatal: self.fatal.clone(),
                    };
                    tokio::spawn(worker::run_worker(ctx, rx));
                }
                DestinationRuntime { name: d.name.clone(), queues, in_flight_by_table }
            })
            .collect();
        // Shared by the transform stage, the schema-change handler, and
        // the shutdown drain below; an `Arc` lets each hold its own
        // handle without fighting over a single move.
        let runtimes = Arc::new(runtimes);

        // Publishes `cdc_backlog_depth` from the live per-table in-flight
        // counters on a fixed cadence, independent of any single batch's
        // completion -- so the gauge keeps climbing while a destination is
        // stalled mid-write instead of only moving on commit (§6).
        let sampler_cancel = cancel.clone();
        let sampler_metrics = self.metrics.clone();
        let sampler_runtimes = runtimes.clone();
        let sampler_handle = tokio::spawn(async move {
            let mut cancel = sampler_cancel;
            loop {
                if *cancel.borrow() {
                    return;
                }
                for rt in sampler_runtimes.iter() {
                    let depth: i64 = rt.in_flight_by_table.iter().map(|e| e.value().load(Ordering::SeqCst)).sum();
                    sampler_metrics.set_backlog_depth(&rt.name, depth.max(0) as u64);
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = cancel.changed() => { if *cancel.borrow() { return; } }
                }
            }
        });

        let transform_cancel = cancel.clone();
        let masking = self.masking.clone();
        let schema_cache = self.schema_cache.clone();
        let quarantine = self.quarantine.clone();
        let paused_tables = self.paused_tables.clone();
        let paused_tables_for_schema_loop = self.paused_tables.clone();
        let families: Vec<DestinationFamily> = self.destinations.iter().map(|d| d.family).collect();
        let dlq = self.dlq.clone();
        let metrics = self.metrics.clone();
        let runtimes_for_transform = runtimes.clone();
        let runtimes_for_schema_loop = runtimes.clone();
        let fatal = self.fatal.clone();

        let transform = async move {
            while let Some(item) = reader_rx.recv().await {
                if *transform_cancel.borrow() {
                    break;
                }
                match item {
                    ReaderEvent::Skip { file, position, reason } => {
                        warn!(file, position, reason, "commit-log frame skipped");
                    }
                    ReaderEvent::Mutation(event, token) => {
                        while paused_tables.contains_key(&event.table) {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            if *transform_cancel.borrow() {
                                return;
                            }
                        }
                        let (masked, audit) = masking.apply(&event);
                        for record in &audit {
                            info!(
                                event_id = %record.event_id,
                                column = %record.column_name,
                                classification = record.classification,
                                strategy = record.strategy,
                                "field masked"
                            );
                        }
                        for (idx, runtime) in runtimes_for_transform.iter().enumerate() {
                            route_to_destination(
                                runtime,
                                families[idx],
                                &schema_cache,
                                &quarantine,
                                &masked,
                                &token,
                                &dlq,
                                &metrics,
                                &fatal,
                            )
                            .await;
                        }
                    }
                }
            }
        };

        let schema_change_cancel = cancel.clone();
        let schema_change_loop = async move {
            while let Some(change) = schema_change_rx.recv().await {
                if *schema_change_cancel.borrow() {
                    break;
                }
                quiesce_and_apply(&change, &paused_tables_for_schema_loop, &runtimes_for_schema_loop, &self.destinations, &self.quarantine).await;
            }
        };

        // Both loops run to completion independently: the transform
        // stage until the reader's channel closes, the schema-change
        // handler until the monitor's channel closes. Neither finishing
        // early should cut the other off.
        tokio::join!(transform, schema_change_loop);

        // Phase (a): drain whatever is still queued, bounded by the
        // shutdown deadline.
        let drain = async {
            for rt in runtimes.iter() {
                for q in &rt.queues {
                    while !q.is_closed() && q.capacity() < q.max_capacity() {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        if q.capacity() == q.max_capacity() {
                            break;
                        }
                    }
                }
            }
        };
        let _ = tokio::time::timeout(self.config.shutdown_deadline, drain).await;

        sampler_handle.abort();

        // Drop senders so worker loops observe channel closure and exit
        // after flushing their current batch.
        drop(runtimes);
        info!("orchestrator shutdown complete");
    }
}

#[allow(clippy::too_many_arguments)]
async fn route_to_destination(
    runtime: &DestinationRuntime,
    family: DestinationFamily,
    schema_cache: &SchemaCache,
    quarantine: &DashMap<(String, String), QuarantineEntry>,
    event: &Event,
    token: &Token,
    dlq: &Arc<dyn DlqWriter>,
    metrics: &MetricsRegistry,
    fatal: &crate::error::FatalSignal,
) {
    if let Some(entry) = quarantine.get(&(runtime.name.clone(), event.table.clone())) {
        worker::write_dlq_direct(dlq, metrics, &runtime.name, event, &entry.category, &entry.reason, 0, fatal).await;
        return;
    }

    let mapper = SchemaMapper::new(family);
    let schema = schema_cache.get(&event.keyspace, &event.table);
    let validator = Validator::new(&mapper);
    if let Err(e) = validator.validate(event, schema.as_ref()) {
        metrics.inc_errors(&runtime.name, e.category());
        worker::write_dlq_direct(dlq, metrics, &runtime.name, event, e.category(), &e.to_string(), 0, fatal).await;
        return;
    }

    let counter = runtime.in_flight_counter(&event.table);
    counter.fetch_add(1, Ordering::SeqCst);
    let slot = worker_slot(&event.partition_key, runtime.queues.len());
    let item = WorkItem { event: event.clone(), token: token.clone(), in_flight: counter };
    if runtime.queues[slot].send(item).await.is_err() {
        // Channel closed: shutting down. Nothing further to do; the
        // event's offset simply never advances and is replayed on
        // restart (§4.9).
    }
}

async fn quiesce_and_apply(
    change: &SchemaChange,
    paused_tables: &Arc<DashMap<String, ()>>,
    runtimes: &[DestinationRuntime],
    destinations: &[Destination],
    quarantine: &Arc<DashMap<(String, String), QuarantineEntry>>,
) {
    let table = change.table.clone();
    info!(table = %table, to_version = change.to_version, "quiescing table for schema change");

    // Step 1 of §4.9's four-step protocol: stop the transform stage from
    // enqueueing any further events for this table before we start
    // waiting for the destinations to drain what's already in flight.
    paused_tables.insert(table.clone(), ());

    let deadline = tokio::time::Instant::now() + QUIESCE_DRAIN_TIMEOUT;
    for rt in runtimes {
        if let Some(counter) = rt.in_flight_by_table.get(&table) {
            while counter.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if counter.load(Ordering::SeqCst) > 0 {
                warn!(destination = %rt.name, table = %table, "destination did not drain before quiesce deadline; applying DDL anyway");
            }
        }
    }

    let mut handles = Vec::new();
    for dest in destinations {
        let sink = dest.sink.clone();
        let change = change.clone();
        let name = dest.name.clone();
        handles.push(tokio::spawn(async move {
            let result = sink.apply_schema_change(&change).await;
            (name, result)
        }));
    }
    for handle in handles {
        if let Ok((name, result)) = handle.await {
            match result {
                Ok(()) => {
                    info!(destination = %name, table = %table, "schema change applied");
                }
                Err(e) => {
                    warn!(destination = %name, table = %table, error = %e, "schema change application failed; quarantining");
                    quarantine.insert((name, table.clone()), QuarantineEntry { category: e.category().to_string(), reason: e.to_string() });
                }
            }
        }
    }

    // Step 4: resume the transform stage for this table, now that every
    // destination has either applied the DDL or been quarantined.
    paused_tables.remove(&table);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: i32) -> KeyMap {
        vec![("user_id".to_string(), crate::event::ColumnValue::Int(n))]
    }

    #[test]
    fn same_partition_key_always_hashes_to_the_same_slot() {
        let a = worker_slot(&key(42), 8);
        let b = worker_slot(&key(42), 8);
        assert_eq!(a, b);
    }

    #[test]
    fn slot_is_within_bounds() {
        for n in 0..100 {
            assert!(worker_slot(&key(n), 4) < 4);
        }
    }

    #[test]
    fn zero_workers_does_not_panic() {
        assert_eq!(worker_slot(&key(1), 0), 0);
    }
}
