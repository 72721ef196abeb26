//! End-to-end scenarios driving the real `CommitLogReader` and
//! `PipelineOrchestrator` against temp-dir commit-log fixtures and the
//! in-memory sink fakes. Row counts are scaled down from the illustrative
//! figures in the design notes (tens rather than hundreds) so the suite
//! stays fast; the behavior each scenario asserts is unaffected by scale.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

use cdc_replicator::config::{Config, MaskingConfig, RetryConfig};
use cdc_replicator::dlq::{DlqRecord, FileDlqWriter};
use cdc_replicator::event::{ColumnValue, EventKind};
use cdc_replicator::mapper::{DestinationFamily, SchemaMapper};
use cdc_replicator::masking::{MaskingRules, MaskingTransform};
use cdc_replicator::metrics::MetricsRegistry;
use cdc_replicator::orchestrator::{Destination, PipelineOrchestrator};
use cdc_replicator::reader::frame::{encode_frame, RawMutation};
use cdc_replicator::reader::CommitLogReader;
use cdc_replicator::schema::{ColumnDef, ColumnOp, Compatibility, SchemaCache, SchemaChange, SchemaMonitor, StaticSchemaSource};
use cdc_replicator::sink::columnar::InMemoryColumnarClient;
use cdc_replicator::sink::relational::InMemoryRelationalClient;
use cdc_replicator::sink::{ColumnarSink, RelationalSink, Sink};

fn user_mutation(user_id: i32, ts: i64, email: &str) -> RawMutation {
    let mut columns = BTreeMap::new();
    columns.insert("email".to_string(), ColumnValue::Text(email.to_string()));
    columns.insert("age".to_string(), ColumnValue::Int(30));
    RawMutation {
        kind: EventKind::Insert,
        keyspace: "ks".to_string(),
        table: "users".to_string(),
        partition_key: vec![("user_id".to_string(), ColumnValue::Int(user_id))],
        clustering_key: None,
        columns,
        source_timestamp_micros: ts,
        ttl_seconds: None,
    }
}

fn order_mutation(order_id: i32, ts: i64) -> RawMutation {
    let mut columns = BTreeMap::new();
    columns.insert("total_cents".to_string(), ColumnValue::Int(1999));
    RawMutation {
        kind: EventKind::Insert,
        keyspace: "ks".to_string(),
        table: "orders".to_string(),
        partition_key: vec![("order_id".to_string(), ColumnValue::Int(order_id))],
        clustering_key: None,
        columns,
        source_timestamp_micros: ts,
        ttl_seconds: None,
    }
}

async fn write_commitlog(dir: &Path, file: &str, mutations: &[RawMutation]) {
    let mut f = tokio::fs::File::create(dir.join(file)).await.unwrap();
    for m in mutations {
        f.write_all(&encode_frame(m)).await.unwrap();
    }
    f.flush().await.unwrap();
}

async fn append_commitlog(dir: &Path, file: &str, mutations: &[RawMutation]) {
    let mut f = tokio::fs::OpenOptions::new().append(true).open(dir.join(file)).await.unwrap();
    for m in mutations {
        f.write_all(&encode_frame(m)).await.unwrap();
    }
    f.flush().await.unwrap();
}

fn test_config(commitlog_dir: &Path, dlq_dir: &Path) -> Config {
    Config {
        batch_size: 8,
        max_batch_bytes: 1024 * 1024,
        max_batch_age: Duration::from_millis(40),
        workers_per_destination: 2,
        max_inflight_batches_per_destination: 8,
        retry: RetryConfig { max_attempts: 4, base_delay: Duration::from_millis(5), multiplier: 2.0, max_delay: Duration::from_millis(40), jitter_frac: 0.1 },
        schema_poll_interval: Duration::from_millis(20),
        shutdown_deadline: Duration::from_millis(500),
        reader_poll_interval: Duration::from_millis(15),
        destinations: HashMap::new(),
        masking: MaskingConfig::default(),
        commitlog_dir: commitlog_dir.to_string_lossy().to_string(),
        dlq_dir: dlq_dir.to_string_lossy().to_string(),
        metrics_addr: "127.0.0.1:0".to_string(),
    }
}

fn relational_destination(client: Arc<InMemoryRelationalClient>, workers: usize) -> Destination {
    Destination {
        name: "relational".to_string(),
        family: DestinationFamily::Relational,
        sink: Arc::new(RelationalSink::new("relational", client, SchemaMapper::new(DestinationFamily::Relational))),
        workers,
    }
}

fn columnar_destination(client: Arc<InMemoryColumnarClient>, workers: usize) -> Destination {
    Destination {
        name: "columnar".to_string(),
        family: DestinationFamily::Columnar,
        sink: Arc::new(ColumnarSink::new("columnar", client, SchemaMapper::new(DestinationFamily::Columnar))),
        workers,
    }
}

/// Everything one test needs running: the commit-log reader and the
/// orchestrator, both spawned against the given destinations, plus the
/// handles to drive schema changes and shut the pipeline down cleanly.
struct Harness {
    _commitlog_dir: tempfile::TempDir,
    dlq_dir: tempfile::TempDir,
    orchestrator: Arc<PipelineOrchestrator>,
    schema_cache: Arc<SchemaCache>,
    metrics: Arc<MetricsRegistry>,
    schema_tx: mpsc::Sender<SchemaChange>,
    cancel_tx: watch::Sender<bool>,
    reader_handle: tokio::task::JoinHandle<()>,
    orchestrator_handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(destinations: Vec<Destination>) -> (Self, std::path::PathBuf) {
        let commitlog_dir = tempfile::tempdir().unwrap();
        let dlq_dir = tempfile::tempdir().unwrap();
        let commitlog_path = commitlog_dir.path().to_path_buf();
        let config = test_config(&commitlog_path, dlq_dir.path());

        let masking = MaskingTransform::new(MaskingRules::defaults(), "test-salt", "test-key");
        let schema_cache = Arc::new(SchemaCache::new());
        let dlq = Arc::new(FileDlqWriter::new(dlq_dir.path()));
        let metrics = Arc::new(MetricsRegistry::new());

        let orchestrator = Arc::new(PipelineOrchestrator::new(config, masking, schema_cache.clone(), dlq, metrics.clone(), destinations));

        let (reader_tx, reader_rx) = mpsc::channel(1024);
        let (schema_tx, schema_rx) = mpsc::channel::<SchemaChange>(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let reader = CommitLogReader::new(commitlog_path.clone(), Duration::from_millis(15));
        let reader_handle = reader.spawn(None, reader_tx, cancel_rx.clone());

        let orch = orchestrator.clone();
        let orchestrator_handle = tokio::spawn(async move {
            orch.run(reader_rx, schema_rx, cancel_rx).await;
        });

        (
            Harness { _commitlog_dir: commitlog_dir, dlq_dir, orchestrator, schema_cache, metrics, schema_tx, cancel_tx, reader_handle, orchestrator_handle },
            commitlog_path,
        )
    }

    async fn shutdown(self) {
        let _ = self.cancel_tx.send(true);
        let _ = self.orchestrator_handle.await;
        self.reader_handle.abort();
    }

    async fn dlq_records(&self) -> Vec<DlqRecord> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(self.dlq_dir.path()).await {
            Ok(rd) => rd,
            Err(_) => return out,
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            let contents = tokio::fs::read_to_string(entry.path()).await.unwrap();
            for line in contents.lines() {
                out.push(serde_json::from_str(line).unwrap());
            }
        }
        out
    }
}

/// Polls `cond` until it returns true or `timeout` elapses, panicking in
/// the latter case. Used instead of a fixed sleep since batch flush timing
/// depends on the scheduler.
async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Same as `wait_until`, but for a condition that itself needs to await
/// (e.g. reading the DLQ's on-disk files).
async fn wait_until_async<F, Fut>(timeout: Duration, mut cond: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn basic_replication_delivers_every_event_to_every_destination() {
    let relational = Arc::new(InMemoryRelationalClient::new());
    let columnar = Arc::new(InMemoryColumnarClient::new());
    let destinations = vec![relational_destination(relational.clone(), 2), columnar_destination(columnar.clone(), 2)];
    let (harness, dir) = Harness::start(destinations).await;

    let mutations: Vec<RawMutation> = (0..40).map(|i| user_mutation(i, 1_000_000 + i as i64, &format!("user{i}@example.com"))).collect();
    write_commitlog(&dir, "commitlog-0001.log", &mutations).await;

    wait_until(Duration::from_secs(5), || relational.row_count("users") == 40 && columnar.row_count("users") == 40, "all 40 rows to land in both destinations").await;

    for i in 0..40 {
        assert!(relational.row("users", &format!("user_id=Int({i})")).is_some());
        assert!(columnar.row("users", &format!("user_id=Int({i})")).is_some());
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn restart_after_crash_does_not_duplicate_rows() {
    let relational = Arc::new(InMemoryRelationalClient::new());
    let destinations = vec![relational_destination(relational.clone(), 2)];
    let (harness, dir) = Harness::start(destinations).await;

    let mutations: Vec<RawMutation> = (0..20).map(|i| user_mutation(i, 1_000_000 + i as i64, &format!("user{i}@example.com"))).collect();
    write_commitlog(&dir, "commitlog-0001.log", &mutations).await;

    wait_until(Duration::from_secs(5), || relational.row_count("users") == 20, "first pass to replicate all 20 rows").await;
    harness.shutdown().await;

    // Simulate a restart: a fresh reader and orchestrator replay the same
    // commit-log directory from scratch (cold start, per main.rs's
    // resolution of the startup-resume Open Question), reusing the same
    // destination client so its offset table carries over from the first
    // run.
    let destinations = vec![relational_destination(relational.clone(), 2)];
    let (harness2, _dir2) = Harness::start(destinations).await;
    // Harness::start created a fresh commit-log dir; point the second
    // reader at the first run's directory instead by writing the same
    // file contents there too, so a full cold replay is exercised.
    write_commitlog(&_dir2, "commitlog-0001.log", &mutations).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(relational.row_count("users"), 20, "a full cold replay of already-committed events must not create duplicates");
    harness2.shutdown().await;
}

#[tokio::test]
async fn pii_and_phi_columns_are_masked_before_reaching_the_sink() {
    let relational = Arc::new(InMemoryRelationalClient::new());
    let destinations = vec![relational_destination(relational.clone(), 1)];
    let (harness, dir) = Harness::start(destinations).await;

    write_commitlog(&dir, "commitlog-0001.log", &[user_mutation(1, 1_000_000, "alice@example.com")]).await;
    wait_until(Duration::from_secs(5), || relational.row_count("users") == 1, "the one row to replicate").await;

    let row = relational.row("users", "user_id=Int(1)").unwrap();
    match row.columns.get("email").unwrap() {
        ColumnValue::Text(s) => {
            assert_eq!(s.len(), 64, "PII email should be a sha256 hex digest, not the original value");
            assert_ne!(s, "alice@example.com");
        }
        other => panic!("expected masked text, got {other:?}"),
    }
    match row.columns.get("age").unwrap() {
        ColumnValue::Int(30) => {}
        other => panic!("age is not PII/PHI and should pass through unmasked, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn compatible_schema_change_applies_ddl_and_replication_continues() {
    let relational = Arc::new(InMemoryRelationalClient::new());
    let destinations = vec![relational_destination(relational.clone(), 1)];
    let (harness, dir) = Harness::start(destinations).await;

    write_commitlog(&dir, "commitlog-0001.log", &[user_mutation(1, 1_000_000, "a@b.com")]).await;
    wait_until(Duration::from_secs(5), || relational.row_count("users") == 1, "the pre-change row to replicate").await;

    // Drive the schema monitor by hand against the orchestrator's own
    // cache: first pass establishes version 1, second observes an added
    // "city" column and emits the resulting SchemaChange.
    let mut before = StaticSchemaSource::new();
    before.set("ks", "users", vec![col("user_id", "uuid", true), col("email", "text", false), col("age", "int", false)]);
    let monitor_before = SchemaMonitor::new(before, harness.schema_cache.clone(), vec![("ks".into(), "users".into())], Duration::from_secs(3600));
    let (discard_tx, _discard_rx) = mpsc::channel(1);
    monitor_before.poll_once(&discard_tx).await.unwrap();

    let mut after = StaticSchemaSource::new();
    after.set("ks", "users", vec![col("user_id", "uuid", true), col("email", "text", false), col("age", "int", false), col("city", "text", false)]);
    let monitor_after = SchemaMonitor::new(after, harness.schema_cache.clone(), vec![("ks".into(), "users".into())], Duration::from_secs(3600));
    monitor_after.poll_once(&harness.schema_tx).await.unwrap();

    wait_until(Duration::from_secs(5), || !relational.ddl_applied().is_empty(), "the add-column DDL to be applied").await;
    let applied = relational.ddl_applied();
    assert_eq!(applied[0].0, "users");
    assert!(matches!(&applied[0].1[0], ColumnOp::Add { column, compatibility: Compatibility::Compatible } if column.name == "city"));

    write_commitlog(&dir, "commitlog-0002.log", &[user_mutation(2, 2_000_000, "c@d.com")]).await;
    wait_until(Duration::from_secs(5), || relational.row_count("users") == 2, "replication to resume for the same table after the DDL lands").await;

    harness.shutdown().await;
}

#[tokio::test]
async fn incompatible_schema_change_quarantines_only_the_affected_table() {
    let relational = Arc::new(InMemoryRelationalClient::new());
    let destinations = vec![relational_destination(relational.clone(), 2)];
    let (harness, dir) = Harness::start(destinations).await;

    write_commitlog(&dir, "commitlog-0001.log", &[user_mutation(1, 1_000_000, "a@b.com"), order_mutation(1, 1_000_001)]).await;
    wait_until(Duration::from_secs(5), || relational.row_count("users") == 1 && relational.row_count("orders") == 1, "both tables' initial rows to land").await;

    let change = SchemaChange {
        keyspace: "ks".to_string(),
        table: "users".to_string(),
        from_version: 1,
        to_version: 2,
        ops: vec![ColumnOp::AlterType { name: "age".to_string(), old_type: "int".to_string(), new_type: "text".to_string(), compatibility: Compatibility::Incompatible }],
    };
    harness.schema_tx.send(change).await.unwrap();

    wait_until(Duration::from_secs(5), || harness.orchestrator.quarantined_tables("relational").contains(&"users".to_string()), "users to become quarantined").await;

    append_commitlog(&dir, "commitlog-0001.log", &[user_mutation(2, 2_000_000, "e@f.com")]).await;
    append_commitlog(&dir, "commitlog-0001.log", &[order_mutation(2, 2_000_001)]).await;

    wait_until(Duration::from_secs(5), || relational.row_count("orders") == 2, "orders to keep replicating despite users being quarantined").await;
    wait_until_async(
        Duration::from_secs(5),
        || async { harness.dlq_records().await.iter().any(|r| r.original_event.table == "users" && r.error_category == "SchemaIncompatible") },
        "the post-quarantine users event to be DLQ'd with errorCategory=SchemaIncompatible",
    )
    .await;

    assert_eq!(relational.row_count("users"), 1, "the quarantined table's post-change event must not be committed");

    harness.shutdown().await;
}

#[tokio::test]
async fn a_transient_destination_failure_retries_and_still_commits() {
    let relational = Arc::new(InMemoryRelationalClient::new());
    let destinations = vec![relational_destination(relational.clone(), 1)];
    let (harness, dir) = Harness::start(destinations).await;

    // One transient failure on the next write, standing in for a brief
    // destination stall -- the retry wrapper (§7) should absorb it rather
    // than losing the batch.
    relational.fail_next_write();
    write_commitlog(&dir, "commitlog-0001.log", &[user_mutation(1, 1_000_000, "a@b.com")]).await;

    wait_until(Duration::from_secs(5), || relational.row_count("users") == 1, "the batch to eventually commit after retrying past the simulated stall").await;
    assert!(relational.row("users", "user_id=Int(1)").is_some());

    harness.shutdown().await;
}

#[tokio::test]
async fn a_stalling_destination_backs_up_then_drains_with_no_row_loss() {
    let relational = Arc::new(InMemoryRelationalClient::new());
    let destinations = vec![relational_destination(relational.clone(), 1)];
    let (harness, dir) = Harness::start(destinations).await;

    // Hold every write blocked mid-transaction before it touches any rows,
    // standing in for a destination that has stopped acknowledging writes
    // (§8 seed scenario 6).
    relational.stall_writes();

    let mutations: Vec<RawMutation> = (0..5).map(|i| user_mutation(i, 1_000_000 + i as i64, &format!("user{i}@example.com"))).collect();
    write_commitlog(&dir, "commitlog-0001.log", &mutations).await;

    wait_until(Duration::from_secs(5), || harness.metrics.backlog_depth("relational") > 0, "backlog depth to rise while the destination is stalled").await;
    assert_eq!(relational.row_count("users"), 0, "no row should land while the destination is stalled");

    relational.release_stall();

    wait_until(Duration::from_secs(5), || relational.row_count("users") == 5, "every event queued during the stall to commit once it releases").await;
    for i in 0..5 {
        assert!(relational.row("users", &format!("user_id=Int({i})")).is_some(), "no row should be lost across the stall");
    }

    wait_until(Duration::from_secs(5), || harness.metrics.backlog_depth("relational") == 0, "backlog depth to drain back to zero after the stall releases").await;
    wait_until(
        Duration::from_secs(5),
        || harness.metrics.replication_lag_seconds("relational").map(|lag| lag < 5.0).unwrap_or(false),
        "replication lag to converge back down once the backlog has drained",
    )
    .await;

    harness.shutdown().await;
}

fn col(name: &str, ty: &str, pk: bool) -> ColumnDef {
    ColumnDef { name: name.to_string(), source_type: ty.to_string(), is_partition_key: pk, is_clustering_key: false, is_static: false }
}
