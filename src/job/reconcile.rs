use std::collections::BTreeSet;

use metrics::counter;
use tracing::{debug, warn};

use super::progress::fraction;
use super::{Job, JobContext, JobError, JobScope};
use crate::model::{DateRange, Fire, ReconciliationStream, SourceId, StreamId};
use crate::observability::RECONCILIATION_SKIPS_TOTAL;
use crate::queryable::EventSet;
use crate::repository::{EventRepository, Repository};

/// Reconcile the fires of every source a stream weights into that stream's events.
pub struct ReconcileJob {
    stream: StreamId,
    sources: BTreeSet<SourceId>,
    range: DateRange,
}

impl ReconcileJob {
    pub fn new(stream: &ReconciliationStream, range: DateRange) -> Self {
        Self {
            stream: stream.id.clone(),
            sources: stream.sources().cloned().collect(),
            range,
        }
    }
}

impl Job for ReconcileJob {
    fn scope(&self) -> JobScope {
        JobScope::Reconcile {
            stream: self.stream.clone(),
            sources: self.sources.clone(),
            range: self.range,
        }
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let repos = &ctx.services.repos;
        ctx.progress.set_progress(0, "Loading fires");
        let stream = repos.catalog.stream(&self.stream)?;
        let method = ctx.services.methods.reconciliation_method(&stream)?;

        let mut fires: Vec<Fire> = Vec::new();
        for source in stream.sources() {
            let loaded = repos.fires.get_by_date(source, self.range)?;
            let before = fires.len();
            let found = loaded.len();
            fires.extend(loaded.into_iter().filter(|f| !f.is_empty()));
            debug!("{found} fires of {source} in range, {} with clumps", fires.len() - before);
        }

        let repo: &dyn EventRepository = repos.events.as_ref();
        let mut events = EventSet::new(repo, stream.id.clone());
        let total = fires.len();
        let mut reconciled = 0;
        for (done, fire) in fires.iter().enumerate() {
            match method.reconcile(fire, &mut events)? {
                Ok(_) => reconciled += 1,
                Err(reason) => {
                    let id = fire.id.map(|id| id.to_string()).unwrap_or_default();
                    warn!("skipping fire {id}: {reason}");
                    counter!(RECONCILIATION_SKIPS_TOTAL, "reason" => reason.label()).increment(1);
                }
            }
            ctx.progress.set_progress(
                fraction(done + 1, total, 5, 85),
                &format!("Reconciled {} of {total} fires", done + 1),
            );
        }

        ctx.progress.set_progress(90, "Saving events");
        let created = events.save_new_entities()?;
        if reconciled == 0 {
            ctx.progress.set_progress(100, "Zero events created");
        } else {
            ctx.progress.set_progress(
                100,
                &format!("Successfully reconciled {reconciled} fires, creating {created} new events"),
            );
        }
        Ok(())
    }
}
