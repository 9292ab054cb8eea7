use std::collections::BTreeSet;
use std::path::PathBuf;

use metrics::counter;
use tracing::{debug, info, warn};

use super::chain::schedule_downstream_jobs;
use super::{AcquireInput, Job, JobContext, JobError, JobScope};
use crate::granularity::day_start;
use crate::model::{DAY_MS, DataPolicy, DateRange, Ms, RawData, Source, SourceId};
use crate::observability::RECORDS_ACQUIRED_TOTAL;

const IRWIN_ID: &str = "IrwinID";

/// Fetch or ingest a source's data, store it and schedule the rest of the chain.
pub struct AcquireJob {
    source: SourceId,
    fetch_time: Ms,
    input: AcquireInput,
    run_reconciliation: bool,
}

impl AcquireJob {
    /// Scheduled fetches always reconcile.
    pub fn fetch(source: SourceId, fetch: String, fetch_time: Ms) -> Self {
        Self {
            source,
            fetch_time,
            input: AcquireInput::Fetch(fetch),
            run_reconciliation: true,
        }
    }

    pub fn upload(source: SourceId, path: PathBuf, fetch_time: Ms, run_reconciliation: bool) -> Self {
        Self {
            source,
            fetch_time,
            input: AcquireInput::Upload(path),
            run_reconciliation,
        }
    }

    fn acquire_once(&self, ctx: &JobContext<'_>, source: &Source) -> Result<Vec<RawData>, JobError> {
        let services = ctx.services;
        match &self.input {
            AcquireInput::Fetch(name) => {
                let fetch = services.repos.catalog.scheduled_fetch(name)?;
                let method = services.methods.fetch_method(&fetch)?;
                Ok(method.fetch(source, self.fetch_time)?)
            }
            AcquireInput::Upload(path) => {
                let method = services.methods.ingest_method(source)?;
                Ok(method.ingest(source, path)?)
            }
        }
    }

    /// Transient I/O failures are retried a fixed number of times with a fixed wait.
    fn acquire(&self, ctx: &JobContext<'_>, source: &Source) -> Result<Vec<RawData>, JobError> {
        let config = &ctx.services.config;
        let mut attempt = 0;
        loop {
            match self.acquire_once(ctx, source) {
                Err(JobError::Acquire(e)) if e.is_transient() && attempt < config.fetch_retry_limit => {
                    attempt += 1;
                    warn!(
                        "acquiring {} failed ({e}), retry {attempt}/{} in {:?}",
                        source.id, config.fetch_retry_limit, config.fetch_retry_wait
                    );
                    ctx.progress.set_progress(5, &format!("Retrying after error: {e}"));
                    std::thread::sleep(config.fetch_retry_wait);
                }
                other => return other,
            }
        }
    }

    /// Drop records ending more than `max_backward_days` before the fetch time.
    fn drop_stale(&self, records: Vec<RawData>, max_backward_days: Option<i64>) -> Vec<RawData> {
        let Some(days) = max_backward_days else {
            return records;
        };
        let cutoff = self.fetch_time - days * DAY_MS;
        let before = records.len();
        let kept: Vec<RawData> = records.into_iter().filter(|r| r.range.end >= cutoff).collect();
        if kept.len() < before {
            debug!("dropped {} records ending before {cutoff}", before - kept.len());
        }
        kept
    }
}

impl Job for AcquireJob {
    fn scope(&self) -> JobScope {
        JobScope::Acquire {
            source: self.source.clone(),
            fetch_time: self.fetch_time,
            input: self.input.clone(),
        }
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let repos = &ctx.services.repos;
        let max_backward_days = ctx.services.config.max_backward_days;
        ctx.progress.set_progress(0, "Acquiring data");
        let source = repos.catalog.source(&self.source)?;

        let records = self.acquire(ctx, &source)?;
        let records = self.drop_stale(records, max_backward_days);
        if records.is_empty() {
            ctx.progress.set_progress(100, "Data unavailable");
            return Ok(());
        }
        ctx.progress.set_progress(40, &format!("Acquired {} records", records.len()));

        let Some(span) = DateRange::hull(records.iter().map(|r| r.range)) else {
            ctx.progress.set_progress(100, "Data unavailable");
            return Ok(());
        };
        let mut earliest = span.start;
        if let Some(days) = max_backward_days {
            earliest = earliest.max(self.fetch_time - days * DAY_MS);
        }
        let latest = span.end.max(earliest);
        let range = DateRange::new(earliest, latest);

        let removed = match source.new_data_policy {
            DataPolicy::Replace => repos.raw_data.delete_by_date(&source.id, range)?,
            DataPolicy::IrwinReplace => {
                let ids: BTreeSet<String> = records
                    .iter()
                    .filter_map(|r| r.attr(IRWIN_ID))
                    .map(str::to_string)
                    .collect();
                repos
                    .raw_data
                    .delete_by_date_and_attribute(&source.id, range, IRWIN_ID, &ids)?
            }
            DataPolicy::Append => 0,
        };
        if removed > 0 {
            info!("replaced {removed} stored records of {}", source.id);
        }
        ctx.progress.set_progress(60, "Saving data");

        let saved = repos.raw_data.save_all(&records)?;
        counter!(RECORDS_ACQUIRED_TOTAL).increment(saved as u64);

        if saved > 0 {
            ctx.progress.set_progress(80, "Scheduling downstream jobs");
            schedule_downstream_jobs(ctx.queue, Some(ctx.id), &source, earliest, latest, self.run_reconciliation)?;
        }

        if let Some(newest) = records.iter().map(|r| r.range.start).max() {
            repos.catalog.set_latest_data(&source.id, day_start(newest))?;
        }
        ctx.progress
            .set_progress(100, &format!("Successfully fetched {saved} records"));
        Ok(())
    }
}
