use tracing::debug;

use super::progress::ScaledProgress;
use super::{Job, JobContext, JobError, JobScope};
use crate::model::{DateRange, RawData, SourceId};

/// Group a source's unclumped raw data of one interval into clumps.
pub struct ClumpJob {
    source: SourceId,
    range: DateRange,
}

impl ClumpJob {
    pub fn new(source: SourceId, range: DateRange) -> Self {
        Self { source, range }
    }
}

impl Job for ClumpJob {
    fn scope(&self) -> JobScope {
        JobScope::Clump {
            source: self.source.clone(),
            range: self.range,
        }
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let repos = &ctx.services.repos;
        ctx.progress.set_progress(0, "Loading raw data");
        let source = repos.catalog.source(&self.source)?;
        let method = ctx.services.methods.clump_method(&source)?;

        let loaded = repos.raw_data.get_by_date(&source.id, self.range)?;
        let total = loaded.len();
        let raw: Vec<RawData> = loaded.into_iter().filter(|r| r.clump.is_none()).collect();
        debug!("{} of {total} records in range are not yet clumped", raw.len());

        let clumps = method.clump(raw, &ScaledProgress::new(ctx.progress, 10, 80))?;
        if clumps.is_empty() {
            ctx.progress.set_progress(100, "Zero clumps created");
            return Ok(());
        }

        ctx.progress.set_progress(80, "Saving clumps");
        for clump in &clumps {
            repos.clumps.save(clump)?;
        }
        ctx.progress
            .set_progress(100, &format!("Successfully created {} clumps", clumps.len()));
        Ok(())
    }
}
