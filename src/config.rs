use std::path::PathBuf;
use std::time::Duration;

use crate::limits::MAX_WORKERS;

/// Process-wide settings, read once at start-up from `EMBERLINE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Jobs allowed to execute at once.
    pub workers: usize,
    pub data_dir: PathBuf,
    /// JSON catalog of sources, streams and scheduled fetches.
    pub catalog: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    /// Records ending more than this many days before the fetch time are dropped.
    /// `None` disables the limit.
    pub max_backward_days: Option<i64>,
    pub fetch_retry_limit: u32,
    pub fetch_retry_wait: Duration,
    /// How long finished jobs stay visible in the queue before the sweeper drops them.
    pub job_retention: Duration,
    pub sweep_interval: Duration,
    /// Job history older than this is dropped when the history log is compacted.
    pub history_retention: Duration,
    /// History appends between compactions.
    pub history_compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            data_dir: PathBuf::from("./data"),
            catalog: None,
            metrics_port: None,
            max_backward_days: None,
            fetch_retry_limit: 2,
            fetch_retry_wait: Duration::from_secs(30),
            job_retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(30 * 86_400),
            history_compact_threshold: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let workers = parsed("EMBERLINE_WORKERS")
            .map(|n| (n as usize).clamp(1, MAX_WORKERS))
            .unwrap_or(defaults.workers);
        let data_dir = lookup("EMBERLINE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let catalog = lookup("EMBERLINE_CATALOG").map(PathBuf::from);
        let metrics_port: Option<u16> = lookup("EMBERLINE_METRICS_PORT").and_then(|s| s.parse().ok());
        let max_backward_days = lookup("EMBERLINE_MAX_BACKWARD_DAYS")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|days| *days > 0);
        let fetch_retry_limit = parsed("EMBERLINE_FETCH_RETRY_LIMIT")
            .map(|n| n as u32)
            .unwrap_or(defaults.fetch_retry_limit);
        let fetch_retry_wait = parsed("EMBERLINE_FETCH_RETRY_WAIT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.fetch_retry_wait);
        let job_retention = parsed("EMBERLINE_JOB_RETENTION_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.job_retention);
        let sweep_interval = parsed("EMBERLINE_SWEEP_INTERVAL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);
        let history_retention = parsed("EMBERLINE_HISTORY_RETENTION_DAYS")
            .map(|days| Duration::from_secs(days * 86_400))
            .unwrap_or(defaults.history_retention);
        let history_compact_threshold = parsed("EMBERLINE_HISTORY_COMPACT_THRESHOLD")
            .filter(|n| *n > 0)
            .unwrap_or(defaults.history_compact_threshold);

        Self {
            workers,
            data_dir,
            catalog,
            metrics_port,
            max_backward_days,
            fetch_retry_limit,
            fetch_retry_wait,
            job_retention,
            sweep_interval,
            history_retention,
            history_compact_threshold,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_WORKERS)
}
