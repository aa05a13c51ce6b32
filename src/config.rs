//! Engine configuration.
//!
//! Priority (highest to lowest): explicit constructor args > `queue.toml` in
//! `data_dir` > built-in defaults. Mirrors the layering the daemon uses for
//! its own config file, minus anything that's the embedding app's concern
//! (ports, relay URLs, license tokens).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{error, warn};

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_MAX_CONCURRENT_GLOBAL: u32 = 50;
const DEFAULT_MAX_CONCURRENT_PER_HOST: u32 = 10;
const DEFAULT_RATE_LIMIT_CAPACITY: u32 = 20;
const DEFAULT_RATE_LIMIT_REFILL_PER_SEC: f64 = 10.0;
const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_CIRCUIT_RESET_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CIRCUIT_HALF_OPEN_MAX_REQUESTS: u32 = 1;
const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 60_000;
const DEFAULT_WORKER_COUNT: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_ORPHAN_SWEEP_MULTIPLIER: u32 = 3;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// `{data_dir}/queue.toml` — all fields optional overrides.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    max_concurrent_global: Option<u32>,
    max_concurrent_per_host: Option<u32>,
    rate_limit_capacity: Option<u32>,
    rate_limit_refill_per_sec: Option<f64>,
    circuit_failure_threshold: Option<u32>,
    circuit_reset_timeout_ms: Option<u64>,
    circuit_half_open_max_requests: Option<u32>,
    base_retry_delay_ms: Option<u64>,
    max_retry_delay_ms: Option<u64>,
    worker_count: Option<usize>,
    poll_interval_ms: Option<u64>,
    max_connections: Option<u32>,
    log: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("queue.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse queue.toml — using defaults");
            None
        }
    }
}

/// Engine-wide configuration: throttling defaults, storage location, worker
/// pool shape. Per-request overrides (priority, max_retries, timeout_ms) live
/// on `RequestInput` instead.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub max_concurrent_global: u32,
    pub max_concurrent_per_host: u32,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_reset_timeout_ms: u64,
    pub circuit_half_open_max_requests: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub orphan_sweep_multiplier: u32,
    /// SQLite connection pool size. Matters once a non-zero `worker_count`
    /// has workers and the operator API issuing reads concurrently.
    pub max_connections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log: "info".to_string(),
            max_concurrent_global: DEFAULT_MAX_CONCURRENT_GLOBAL,
            max_concurrent_per_host: DEFAULT_MAX_CONCURRENT_PER_HOST,
            rate_limit_capacity: DEFAULT_RATE_LIMIT_CAPACITY,
            rate_limit_refill_per_sec: DEFAULT_RATE_LIMIT_REFILL_PER_SEC,
            circuit_failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            circuit_reset_timeout_ms: DEFAULT_CIRCUIT_RESET_TIMEOUT_MS,
            circuit_half_open_max_requests: DEFAULT_CIRCUIT_HALF_OPEN_MAX_REQUESTS,
            base_retry_delay_ms: DEFAULT_BASE_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            orphan_sweep_multiplier: DEFAULT_ORPHAN_SWEEP_MULTIPLIER,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl EngineConfig {
    /// Build config from an explicit `data_dir`, layering `queue.toml` over
    /// built-in defaults. Pass `None` to use the default data directory.
    pub fn load(data_dir: Option<PathBuf>) -> Self {
        let mut cfg = Self::default();
        let data_dir = data_dir.unwrap_or_else(|| cfg.data_dir.clone());
        let toml = load_toml(&data_dir).unwrap_or_default();

        cfg.data_dir = data_dir;
        if let Some(v) = toml.max_concurrent_global {
            cfg.max_concurrent_global = v;
        }
        if let Some(v) = toml.max_concurrent_per_host {
            cfg.max_concurrent_per_host = v;
        }
        if let Some(v) = toml.rate_limit_capacity {
            cfg.rate_limit_capacity = v;
        }
        if let Some(v) = toml.rate_limit_refill_per_sec {
            cfg.rate_limit_refill_per_sec = v;
        }
        if let Some(v) = toml.circuit_failure_threshold {
            cfg.circuit_failure_threshold = v;
        }
        if let Some(v) = toml.circuit_reset_timeout_ms {
            cfg.circuit_reset_timeout_ms = v;
        }
        if let Some(v) = toml.circuit_half_open_max_requests {
            cfg.circuit_half_open_max_requests = v;
        }
        if let Some(v) = toml.base_retry_delay_ms {
            cfg.base_retry_delay_ms = v;
        }
        if let Some(v) = toml.max_retry_delay_ms {
            cfg.max_retry_delay_ms = v;
        }
        if let Some(v) = toml.worker_count {
            cfg.worker_count = v;
        }
        if let Some(v) = toml.poll_interval_ms {
            cfg.poll_interval_ms = v;
        }
        if let Some(v) = toml.max_connections {
            cfg.max_connections = v;
        }
        if let Some(v) = toml.log {
            cfg.log = v;
        }

        if cfg.worker_count == 0 {
            warn!("worker_count is 0 in queue.toml — no requests will ever be dispatched");
        }

        cfg
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }
}
