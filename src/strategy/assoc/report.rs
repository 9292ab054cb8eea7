use super::{
    MethodError, SingleFieldConfig, fill_missing, fire_mut, first_report, matches_identifier, resolve,
};
use crate::model::{Clump, Fire};
use crate::queryable::FireSet;
use crate::strategy::{Association, AssociationMethod, Attached, SkipReason};

/// Incident reports matched by an identifier attribute. A newer report replaces the fire's
/// area and attributes; an older one only fills gaps.
pub struct Ics209 {
    config: SingleFieldConfig,
}

impl Ics209 {
    pub fn new(config: SingleFieldConfig) -> Self {
        Self { config }
    }
}

impl AssociationMethod for Ics209 {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError> {
        let report = match first_report(&clump) {
            Ok(report) => report,
            Err(skip) => return Ok(Err(skip)),
        };
        let field = self.config.field.as_str();
        let Some(identifier) = report.attr(field).map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(Err(SkipReason::MissingField(field.to_string())));
        };
        let candidates = fires.get_matching(self.config.window.around(&clump), |fire| {
            matches_identifier(fire, field, identifier)
        })?;
        let attached = resolve(fires, candidates, &clump.source)?;

        let fire = fire_mut(fires, attached.key)?;
        if attached.created {
            fire.area = clump.area;
        }
        let previous_end = fire.range().map(|r| r.end);
        fire.add_clump(clump)?;
        let newer = previous_end.is_some_and(|end| report.range.end > end);
        if newer {
            fire.area = report.area;
            fire.attributes.extend(report.attributes);
        } else {
            fill_missing(&mut fire.attributes, &report.attributes);
        }
        Ok(Ok(attached))
    }
}

/// Treatment reports: every report is a fire of its own.
pub struct Facts;

impl AssociationMethod for Facts {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError> {
        let report = match first_report(&clump) {
            Ok(report) => report,
            Err(skip) => return Ok(Err(skip)),
        };
        let mut fire = Fire::new(clump.source.clone());
        fire.add_clump(clump)?;
        fire.area = report.area;
        fill_missing(&mut fire.attributes, &report.attributes);
        Ok(Ok(Attached {
            key: fires.add(fire),
            created: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::Window;
    use super::super::testing::*;
    use super::*;
    use crate::repository::FireRepository;
    use crate::store::InMemoryStore;

    fn ics209() -> Ics209 {
        Ics209::new(SingleFieldConfig {
            window: Window {
                forward_days: 3,
                backward_days: 3,
            },
            field: "IncidentID".into(),
        })
    }

    #[test]
    fn newer_report_overwrites() {
        let store = InMemoryStore::new();
        stored_fire(
            &store,
            vec![report(0.0, 10.0, "2024-06-01", 400.0, &[("IncidentID", "MT-1"), ("Status", "active")])],
            &[("IncidentID", "MT-1"), ("Status", "active")],
        );
        let repo: &dyn FireRepository = &store;
        let mut fires = FireSet::new(repo, source());

        // different location, same incident
        let newer = report(500.0, 10.0, "2024-06-02", 900.0, &[("IncidentID", " mt-1 "), ("Status", "contained")]);
        let attached = ics209().associate(newer, &mut fires).unwrap().unwrap();
        assert!(!attached.created);
        let fire = fires.get(attached.key).unwrap();
        assert_eq!(fire.area, 900.0);
        assert_eq!(fire.attributes["Status"], "contained");
    }

    #[test]
    fn older_report_only_fills_gaps() {
        let store = InMemoryStore::new();
        stored_fire(
            &store,
            vec![report(0.0, 10.0, "2024-06-03", 400.0, &[("IncidentID", "MT-1")])],
            &[("IncidentID", "MT-1"), ("Status", "active")],
        );
        let repo: &dyn FireRepository = &store;
        let mut fires = FireSet::new(repo, source());

        let older = report(0.0, 10.0, "2024-06-01", 100.0, &[("IncidentID", "MT-1"), ("Status", "x"), ("Cause", "lightning")]);
        let attached = ics209().associate(older, &mut fires).unwrap().unwrap();
        let fire = fires.get(attached.key).unwrap();
        assert_eq!(fire.area, 400.0);
        assert_eq!(fire.attributes["Status"], "active");
        assert_eq!(fire.attributes["Cause"], "lightning");
        assert_eq!(fire.clumps().len(), 2);
    }

    #[test]
    fn first_report_creates_fire_with_clump_area() {
        let store = InMemoryStore::new();
        let repo: &dyn FireRepository = &store;
        let mut fires = FireSet::new(repo, source());
        let attached = ics209()
            .associate(report(0.0, 10.0, "2024-06-01", 321.0, &[("IncidentID", "A")]), &mut fires)
            .unwrap()
            .unwrap();
        assert!(attached.created);
        assert_eq!(fires.get(attached.key).unwrap().area, 321.0);
    }

    #[test]
    fn report_without_identifier_is_skipped() {
        let store = InMemoryStore::new();
        let repo: &dyn FireRepository = &store;
        let mut fires = FireSet::new(repo, source());
        let outcome = ics209()
            .associate(report(0.0, 10.0, "2024-06-01", 1.0, &[("IncidentID", "  ")]), &mut fires)
            .unwrap();
        assert_eq!(outcome, Err(SkipReason::MissingField("IncidentID".into())));
    }

    #[test]
    fn facts_never_reuses_fires() {
        let store = InMemoryStore::new();
        let repo: &dyn FireRepository = &store;
        let mut fires = FireSet::new(repo, source());
        for _ in 0..2 {
            let attached = Facts
                .associate(report(0.0, 10.0, "2024-06-01", 55.0, &[("Treatment", "pile")]), &mut fires)
                .unwrap()
                .unwrap();
            assert!(attached.created);
            assert_eq!(fires.get(attached.key).unwrap().area, 55.0);
        }
        assert_eq!(fires.len(), 2);
    }
}
