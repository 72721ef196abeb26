//! The metrics-and-health HTTP surface named in §6. Kept thin and
//! hand-rolled on `axum` rather than pulling in a metrics framework,
//! matching the teacher's own `api::monitoring`/`api::rest` style of a
//! small `Router` over a shared `Arc<AppState>`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;

use crate::metrics::MetricsRegistry;
use crate::orchestrator::PipelineOrchestrator;
use crate::sink::{DependencyStatus, Sink};

/// One destination's contribution to `/healthz`: its own `healthCheck`
/// result, downgraded to `degraded` if any table on it is quarantined.
#[derive(Debug, Serialize)]
struct DependencyHealth {
    status: &'static str,
    latency_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    dependencies: std::collections::BTreeMap<String, DependencyHealth>,
}

pub struct AppState {
    pub metrics: Arc<MetricsRegistry>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).route("/healthz", get(health_handler)).with_state(state)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dependencies = std::collections::BTreeMap::new();
    let mut any_unhealthy = false;
    let mut any_degraded = false;

    for (name, sink) in state.orchestrator.sinks() {
        let quarantined_tables = state.orchestrator.quarantined_tables(name);
        let dep = match sink.health_check().await {
            Ok(h) => {
                let status = if !quarantined_tables.is_empty() {
                    any_degraded = true;
                    "degraded"
                } else {
                    match h.status {
                        DependencyStatus::Healthy => "healthy",
                        DependencyStatus::Degraded => {
                            any_degraded = true;
                            "degraded"
                        }
                        DependencyStatus::Unhealthy => {
                            any_unhealthy = true;
                            "unhealthy"
                        }
                    }
                };
                DependencyHealth {
                    status,
                    latency_ms: h.latency.as_millis(),
                    error: if quarantined_tables.is_empty() { h.error } else { Some(format!("quarantined tables: {}", quarantined_tables.join(", "))) },
                }
            }
            Err(e) => {
                any_unhealthy = true;
                DependencyHealth { status: "unhealthy", latency_ms: 0, error: Some(e.to_string()) }
            }
        };
        dependencies.insert(name.to_string(), dep);
    }

    let status = if any_unhealthy {
        "unhealthy"
    } else if any_degraded {
        "degraded"
    } else {
        "healthy"
    };

    let body = HealthResponse { status, uptime_seconds: state.started_at.elapsed().as_secs(), dependencies };
    let code = if any_unhealthy { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (code, Json(body))
}
