//! Process-wide configuration.
//!
//! Loading this from a YAML file on disk is the external collaborator named
//! in the spec's scope section and is not implemented here; `Config` is the
//! in-process value every component borrows instead of reaching for ambient
//! state. A handful of env vars can override defaults at startup, which is
//! enough for container-based deployment without pulling in a config-file
//! loader this crate doesn't own.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_frac: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_frac: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Opaque credential reference; never logged.
    pub credentials: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self { enabled: false, host: String::new(), port: 0, database: String::new(), credentials: String::new() }
    }
}

#[derive(Debug, Clone)]
pub struct MaskingConfig {
    pub pii_patterns: Vec<String>,
    pub phi_patterns: Vec<String>,
    pub salt: String,
    pub key_id: String,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            pii_patterns: Vec::new(),
            phi_patterns: Vec::new(),
            salt: "default-salt".to_string(),
            key_id: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub batch_size: usize,
    pub max_batch_bytes: usize,
    pub max_batch_age: Duration,
    pub workers_per_destination: usize,
    pub max_inflight_batches_per_destination: usize,
    pub retry: RetryConfig,
    pub schema_poll_interval: Duration,
    pub shutdown_deadline: Duration,
    pub reader_poll_interval: Duration,
    pub destinations: HashMap<String, DestinationConfig>,
    pub masking: MaskingConfig,
    pub commitlog_dir: String,
    pub dlq_dir: String,
    pub metrics_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batch_bytes: 1024 * 1024,
            max_batch_age: Duration::from_millis(1000),
            workers_per_destination: 4,
            max_inflight_batches_per_destination: 8,
            retry: RetryConfig::default(),
            schema_poll_interval: Duration::from_millis(30_000),
            shutdown_deadline: Duration::from_millis(30_000),
            reader_poll_interval: Duration::from_millis(200),
            destinations: HashMap::new(),
            masking: MaskingConfig::default(),
            commitlog_dir: "./commitlog".to_string(),
            dlq_dir: "./dlq".to_string(),
            metrics_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

impl Config {
    /// Applies a handful of well-known env var overrides on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("CDC_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                cfg.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("CDC_COMMITLOG_DIR") {
            cfg.commitlog_dir = v;
        }
        if let Ok(v) = std::env::var("CDC_DLQ_DIR") {
            cfg.dlq_dir = v;
        }
        if let Ok(v) = std::env::var("CDC_METRICS_ADDR") {
            cfg.metrics_addr = v;
        }
        cfg
    }
}
