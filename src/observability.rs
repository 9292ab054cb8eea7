use std::net::SocketAddr;

// ── Job metrics ─────────────────────────────────────────────────

/// Counter: finished jobs. Labels: kind, status.
pub const JOBS_TOTAL: &str = "emberline_jobs_total";

/// Gauge: jobs currently executing on the worker pool.
pub const JOBS_RUNNING: &str = "emberline_jobs_running";

/// Histogram: job execution time in seconds. Labels: kind.
pub const JOB_DURATION_SECONDS: &str = "emberline_job_duration_seconds";

/// Counter: jobs abandoned at start because a conflicting job was running.
pub const JOB_CONFLICTS_TOTAL: &str = "emberline_job_conflicts_total";

// ── Pipeline metrics ────────────────────────────────────────────

/// Histogram: dissolve wall time in seconds.
pub const DISSOLVE_DURATION_SECONDS: &str = "emberline_dissolve_duration_seconds";

/// Counter: union retries after a topology failure. Labels: tier.
pub const UNION_FALLBACKS_TOTAL: &str = "emberline_union_fallbacks_total";

/// Counter: clumps that association skipped. Labels: reason.
pub const ASSOCIATION_SKIPS_TOTAL: &str = "emberline_association_skips_total";

/// Counter: fires that reconciliation skipped. Labels: reason.
pub const RECONCILIATION_SKIPS_TOTAL: &str = "emberline_reconciliation_skips_total";

/// Counter: raw data records saved by acquire jobs.
pub const RECORDS_ACQUIRED_TOTAL: &str = "emberline_records_acquired_total";

/// Histogram: job history flush duration in seconds.
pub const HISTORY_FLUSH_DURATION_SECONDS: &str = "emberline_history_flush_duration_seconds";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Outcome label for `JOBS_TOTAL`.
pub fn status_label(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}
