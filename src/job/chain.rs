//! Building the acquire -> clump -> associate -> reconcile chain for one trigger.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use super::acquire::AcquireJob;
use super::associate::AssociateJob;
use super::clump::ClumpJob;
use super::reconcile::ReconcileJob;
use super::{JobError, JobId, JobQueue, QueuedJob};
use crate::granularity::format_day;
use crate::model::{DAY_MS, DateRange, Ms, Source, SourceId, StreamId};

/// "for YYYY-MM-DD" for a single day, "between A and B" otherwise.
pub fn describe_interval(range: &DateRange) -> String {
    let start = format_day(range.start);
    let end = format_day(range.end);
    if start == end {
        format!("for {start}")
    } else {
        format!("between {start} and {end}")
    }
}

/// Queue the scheduled fetch `fetch_name` for the day `date_offset` days before `trigger`.
pub fn schedule_fetch(queue: &JobQueue, fetch_name: &str, trigger: Ms) -> Result<Arc<QueuedJob>, JobError> {
    let services = queue.services();
    let fetch = services.repos.catalog.scheduled_fetch(fetch_name)?;
    let source = services.repos.catalog.source(&fetch.source)?;
    services.methods.validate_fetch(&fetch)?;
    services.methods.validate_source(&source)?;

    let at = trigger - fetch.date_offset * DAY_MS;
    let name = format!("{}: Fetch {} for {}", fetch.name, source.name, format_day(at));
    let job = AcquireJob::fetch(source.id.clone(), fetch.name.clone(), at);
    Ok(queue.enqueue_if_none_equivalent(job, name, &[]))
}

/// Queue ingest of an uploaded file for `source`.
pub fn schedule_upload(
    queue: &JobQueue,
    source: &SourceId,
    path: PathBuf,
    at: Ms,
    run_reconciliation: bool,
) -> Result<Arc<QueuedJob>, JobError> {
    let services = queue.services();
    let source = services.repos.catalog.source(source)?;
    services.methods.validate_source(&source)?;

    let name = format!("{}: Upload Ingest for {}", source.name, format_day(at));
    let job = AcquireJob::upload(source.id.clone(), path, at, run_reconciliation);
    Ok(queue.enqueue_if_none_equivalent(job, name, &[]))
}

/// Queue a lone reconciliation of `stream` over `range`.
pub fn schedule_reconciliation(queue: &JobQueue, stream: &StreamId, range: DateRange) -> Result<Arc<QueuedJob>, JobError> {
    let services = queue.services();
    let stream = services.repos.catalog.stream(stream)?;
    services.methods.validate_stream(&stream)?;

    let name = format!("Reconcile {} {}", stream.name, describe_interval(&range));
    let job = ReconcileJob::new(&stream, range);
    Ok(queue.enqueue_if_none_equivalent(job, name, &[]))
}

/// Queue the clump and associate jobs for every granularity interval of `[earliest, latest]`
/// and, when `run_reconciliation` is set, a reconcile job per auto-reconciling stream that
/// weights `source`. Everything depends on `upstream`. Returns the jobs in the order queued.
pub fn schedule_downstream_jobs(
    queue: &JobQueue,
    upstream: Option<JobId>,
    source: &Source,
    earliest: Ms,
    latest: Ms,
    run_reconciliation: bool,
) -> Result<Vec<Arc<QueuedJob>>, JobError> {
    let mut queued = Vec::new();
    let mut associate_jobs: Vec<JobId> = Vec::new();
    let upstream: Vec<JobId> = upstream.into_iter().collect();

    for interval in source.granularity.intervals(earliest, latest) {
        let description = describe_interval(&interval);

        let clump = queue.enqueue_if_none_equivalent(
            ClumpJob::new(source.id.clone(), interval),
            format!("Clump {} {description}", source.name),
            &upstream,
        );

        let mut deps = associate_jobs.clone();
        deps.push(clump.id());
        let associate = queue.enqueue_if_none_equivalent(
            AssociateJob::new(source.id.clone(), interval),
            format!("Associate {} {description}", source.name),
            &deps,
        );
        if !associate_jobs.contains(&associate.id()) {
            associate_jobs.push(associate.id());
        }
        queued.push(clump);
        queued.push(associate);
    }

    if run_reconciliation {
        let range = DateRange::new(earliest, latest.max(earliest));
        let mut deps = associate_jobs;
        for stream in queue.services().repos.catalog.streams()? {
            if !stream.auto_reconcile || !stream.includes(&source.id) {
                continue;
            }
            let reconcile = queue.enqueue_if_none_equivalent(
                ReconcileJob::new(&stream, range),
                format!("Reconcile {} {}", stream.name, describe_interval(&range)),
                &deps,
            );
            if !deps.contains(&reconcile.id()) {
                deps.push(reconcile.id());
            }
            queued.push(reconcile);
        }
    }

    info!("scheduled {} downstream jobs for {}", queued.len(), source.name);
    Ok(queued)
}
