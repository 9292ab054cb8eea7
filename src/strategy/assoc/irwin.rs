use chrono::NaiveDateTime;
use tracing::info;

use super::{MethodError, fire_mut, first_report, matches_identifier, resolve};
use crate::geometry;
use crate::model::{Clump, DateRange, Fire, RawData};
use crate::queryable::FireSet;
use crate::strategy::{Association, AssociationMethod, SkipReason};

const INCIDENT_ID: &str = "IrwinID";
const IN_CONFLICT: &str = "InConflict";
const IS_ACTIVE: &str = "IsActive";
const INCIDENT_TYPE_CATEGORY: &str = "IncidentTypeCategory";
const FALSE_ALARM: &str = "FA";
const MODIFIED: &str = "ModifiedOnDateTime";
const MODIFIED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// 1970-01-01 through 2070-01-01: incidents are matched by id regardless of date.
const ALL_TIME: DateRange = DateRange {
    start: 0,
    end: 3_155_760_000_000,
};

/// Incident feed records keyed by `IrwinID`. Withdrawn incidents tear down their fires; the
/// freshest record's attributes win.
pub struct Irwin;

impl AssociationMethod for Irwin {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError> {
        let report = match first_report(&clump) {
            Ok(report) => report,
            Err(skip) => return Ok(Err(skip)),
        };
        let Some(incident) = report.attr(INCIDENT_ID).map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(Err(SkipReason::MissingField(INCIDENT_ID.to_string())));
        };
        let candidates = fires.get_matching(ALL_TIME, |fire| matches_identifier(fire, INCIDENT_ID, incident))?;

        if is_withdrawn(&report) {
            for key in candidates {
                if let Some(mut fire) = fires.remove(key) {
                    let detached = fire.remove_clumps();
                    info!("incident {incident} withdrawn; released {} clumps", detached.len());
                }
            }
            return Ok(Err(SkipReason::IncidentWithdrawn(incident.to_string())));
        }

        let attached = resolve(fires, candidates, &clump.source)?;
        let fire = fire_mut(fires, attached.key)?;
        fire.add_clump(clump)?;
        fire.area = geometry::area(&fire.shape);
        if fire.attributes.is_empty() || is_more_recent(&report, fire) {
            fire.attributes = report.attributes;
        }
        Ok(Ok(attached))
    }
}

fn flag(report: &RawData, field: &str, value: &str) -> bool {
    report.attr(field).is_some_and(|v| v.trim().eq_ignore_ascii_case(value))
}

fn is_withdrawn(report: &RawData) -> bool {
    flag(report, IN_CONFLICT, "true") || flag(report, IS_ACTIVE, "false") || flag(report, INCIDENT_TYPE_CATEGORY, FALSE_ALARM)
}

/// Whether the report was modified after the fire's current attributes. A fire without a
/// modification time is always older; a report without one never is.
fn is_more_recent(report: &RawData, fire: &Fire) -> bool {
    let Some(current) = fire.attributes.get(MODIFIED) else {
        return true;
    };
    let Some(candidate) = report.attr(MODIFIED) else {
        return false;
    };
    match (
        NaiveDateTime::parse_from_str(candidate.trim(), MODIFIED_FORMAT),
        NaiveDateTime::parse_from_str(current.trim(), MODIFIED_FORMAT),
    ) {
        (Ok(candidate), Ok(current)) => candidate > current,
        _ => false,
    }
}
