//! Entry point: wires the reader, masking, validator/mapper, sinks, and
//! orchestrator (§4) into one running pipeline, plus the `/metrics` and
//! `/healthz` HTTP surface (§6).
//!
//! Building the configured `RelationalClient`/`ColumnarClient` instances
//! from real network connections, and the source catalog client behind
//! `SchemaSource`, are the external collaborators named in §1 and are not
//! implemented here; this binary wires the in-memory stand-ins so the
//! pipeline is runnable end to end, the way it is exercised in this
//! crate's own integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use cdc_replicator::config::Config;
use cdc_replicator::dlq::FileDlqWriter;
use cdc_replicator::http::{self, AppState};
use cdc_replicator::mapper::{DestinationFamily, SchemaMapper};
use cdc_replicator::masking::{MaskingRules, MaskingTransform};
use cdc_replicator::metrics::MetricsRegistry;
use cdc_replicator::orchestrator::{Destination, PipelineOrchestrator};
use cdc_replicator::reader::CommitLogReader;
use cdc_replicator::schema::{SchemaCache, SchemaChange};
use cdc_replicator::sink::columnar::InMemoryColumnarClient;
use cdc_replicator::sink::relational::InMemoryRelationalClient;
use cdc_replicator::sink::{ColumnarSink, RelationalSink, Sink};
use cdc_replicator::Result;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();
}

/// Builds the configured destination list from `config.destinations`,
/// keyed by the well-known names `relational`, `time_series`, and
/// `columnar` (§4.6: the relational protocol also backs time-series,
/// differing only in its `SchemaMapper` family).
fn build_destinations(config: &Config) -> Vec<Destination> {
    let mut destinations = Vec::new();
    for (name, dest_cfg) in &config.destinations {
        if !dest_cfg.enabled {
            continue;
        }
        let family = match name.as_str() {
            "relational" => DestinationFamily::Relational,
            "time_series" => DestinationFamily::TimeSeries,
            "columnar" => DestinationFamily::Columnar,
            other => {
                warn!(destination = other, "unrecognized destination name; skipping");
                continue;
            }
        };
        let sink: Arc<dyn Sink> = match family {
            DestinationFamily::Columnar => Arc::new(ColumnarSink::new(
                name.clone(),
                Arc::new(InMemoryColumnarClient::new()),
                SchemaMapper::new(family),
            )),
            DestinationFamily::Relational | DestinationFamily::TimeSeries => Arc::new(RelationalSink::new(
                name.clone(),
                Arc::new(InMemoryRelationalClient::new()),
                SchemaMapper::new(family),
            )),
        };
        destinations.push(Destination { name: name.clone(), family, sink, workers: config.workers_per_destination });
    }
    destinations
}

/// Resolves on the first of ctrl-c or SIGTERM (the orchestrator's
/// two-phase shutdown then drains within `shutdownDeadlineMs`, §4.9).
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Runs the pipeline to completion, returning the process exit code
/// (§6: 0 clean, 2 config invalid, 3 source unreachable at startup, 4
/// fatal DLQ failure). Setup failures that don't fall into one of those
/// named classes propagate as `Err` and become exit code 1 in `main`.
async fn run() -> Result<i32> {
    let config = Config::from_env();

    if tokio::fs::metadata(&config.commitlog_dir).await.is_err() {
        error!(dir = %config.commitlog_dir, "commit-log source directory is unreachable at startup");
        return Ok(3);
    }

    let destinations = build_destinations(&config);
    if destinations.is_empty() {
        error!("no destination is both recognized and enabled in configuration");
        return Ok(2);
    }

    let masking = MaskingTransform::new(
        MaskingRules::from_config(config.masking.pii_patterns.clone(), config.masking.phi_patterns.clone()),
        config.masking.salt.clone(),
        config.masking.key_id.clone(),
    );
    let schema_cache = Arc::new(SchemaCache::new());
    let dlq = Arc::new(FileDlqWriter::new(config.dlq_dir.clone()));
    let metrics = Arc::new(MetricsRegistry::new());

    let reader_poll_interval = config.reader_poll_interval;
    let commitlog_dir = config.commitlog_dir.clone();
    let metrics_addr = config.metrics_addr.clone();

    let orchestrator = Arc::new(PipelineOrchestrator::new(config, masking, schema_cache, dlq, metrics.clone(), destinations));

    let (reader_tx, reader_rx) = mpsc::channel(1024);
    // No source-catalog `SchemaSource` implementation is wired here (see
    // the module doc above); dropping the sender immediately closes
    // `schema_change_rx` so the orchestrator's schema-change loop exits
    // cleanly rather than blocking forever on a monitor that never runs.
    let (schema_tx, schema_change_rx) = mpsc::channel::<SchemaChange>(16);
    drop(schema_tx);
    info!("schema drift detection is disabled: no source catalog client configured");

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let reader = CommitLogReader::new(commitlog_dir, reader_poll_interval);
    let reader_handle = reader.spawn(None, reader_tx, cancel_rx.clone());

    let app_state = Arc::new(AppState { metrics: metrics.clone(), orchestrator: orchestrator.clone(), started_at: Instant::now() });
    let listener = tokio::net::TcpListener::bind(metrics_addr.as_str()).await?;
    info!(addr = %metrics_addr, "metrics and health endpoint listening");
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, http::router(app_state)).await {
            error!(error = %e, "metrics server stopped unexpectedly");
        }
    });

    let pipeline_orchestrator = orchestrator.clone();
    let pipeline_cancel = cancel_rx.clone();
    let pipeline_handle = tokio::spawn(async move {
        pipeline_orchestrator.run(reader_rx, schema_change_rx, pipeline_cancel).await;
    });

    let fatal = orchestrator.fatal_signal();
    let mut exit_code = 0;
    loop {
        tokio::select! {
            _ = shutdown_signal() => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if fatal.tripped() {
                    error!("fatal condition detected: dead-letter queue write failed; halting rather than risk the DLQ-or-committed invariant");
                    exit_code = 4;
                    break;
                }
            }
        }
    }

    let _ = cancel_tx.send(true);
    let _ = pipeline_handle.await;
    reader_handle.abort();
    http_handle.abort();

    info!("shutdown complete");
    Ok(exit_code)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "uncaught internal error");
            1
        }
    };
    std::process::exit(code);
}
