use std::collections::BTreeSet;

use metrics::counter;
use tracing::{debug, info, warn};

use super::progress::fraction;
use super::{Job, JobContext, JobError, JobScope};
use crate::model::{DateRange, SourceId, UNKNOWN_FIRE_TYPE};
use crate::observability::ASSOCIATION_SKIPS_TOTAL;
use crate::queryable::{EntityKey, FireSet};
use crate::repository::FireRepository;

/// Attach a source's unassociated clumps of one interval to fires.
pub struct AssociateJob {
    source: SourceId,
    range: DateRange,
}

impl AssociateJob {
    pub fn new(source: SourceId, range: DateRange) -> Self {
        Self { source, range }
    }
}

impl Job for AssociateJob {
    fn scope(&self) -> JobScope {
        JobScope::Associate {
            source: self.source.clone(),
            range: self.range,
        }
    }

    fn execute(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        let repos = &ctx.services.repos;
        let methods = &ctx.services.methods;
        ctx.progress.set_progress(0, "Removing orphaned fires");
        let source = repos.catalog.source(&self.source)?;
        let orphans = repos.fires.delete_orphaned(&source.id)?;
        if orphans > 0 {
            info!("deleted {orphans} orphaned fires of {}", source.id);
        }

        let association = methods.association_method(&source)?;
        let probability = methods.probability_method(&source)?;
        let fire_type = methods.fire_type_method(&source)?;

        ctx.progress.set_progress(5, "Loading clumps");
        let clumps = repos.clumps.get_unassociated(&source.id, self.range)?;
        let total = clumps.len();
        let repo: &dyn FireRepository = repos.fires.as_ref();
        let mut fires = FireSet::new(repo, source.id.clone());

        let mut touched: BTreeSet<EntityKey> = BTreeSet::new();
        let mut associated = 0;
        for (done, clump) in clumps.into_iter().enumerate() {
            let clump_id = clump.id;
            match association.associate(clump, &mut fires)? {
                Ok(attached) => {
                    touched.insert(attached.key);
                    associated += 1;
                }
                Err(reason) => {
                    warn!("skipping clump {clump_id}: {reason}");
                    counter!(ASSOCIATION_SKIPS_TOTAL, "reason" => reason.label()).increment(1);
                }
            }
            ctx.progress.set_progress(
                fraction(done + 1, total, 10, 80),
                &format!("Associated {} of {total} clumps", done + 1),
            );
        }

        ctx.progress.set_progress(80, "Scoring fires");
        for key in touched {
            let Some(fire) = fires.get(key) else { continue };
            let p = probability.fire_probability(fire);
            let mut kind = fire_type.fire_type(fire);
            if kind.trim().is_empty() {
                kind = UNKNOWN_FIRE_TYPE.to_string();
            }
            if let Some(fire) = fires.get_mut(key) {
                fire.probability = p;
                fire.fire_type = kind;
                fire.refresh_display_name(&source.fire_name_field);
            }
        }

        ctx.progress.set_progress(90, "Saving fires");
        let created = fires.save_new_entities()?;
        debug!("{created} new fires of {}", source.id);

        if created == 0 {
            ctx.progress.set_progress(100, "Zero fires created");
        } else {
            ctx.progress.set_progress(
                100,
                &format!("Successfully associated {associated} clumps into {created} fires"),
            );
        }
        Ok(())
    }
}
