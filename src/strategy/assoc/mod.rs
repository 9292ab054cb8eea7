//! Association methods: attach each clump to a fire of its source.
//!
//! Every method follows the same shape. Find candidate fires in a time window around the clump,
//! then create a fire (no candidates), reuse one (one candidate) or merge them (several), add the
//! clump and refresh the fire's area and attributes.

mod daily_area;
mod ground_report;
mod irwin;
mod predicate;
mod report;

pub use daily_area::{AreaRule, CwfisAreaConfig, DailyArea, DailyAreaConfig, GeoMac};
pub use ground_report::{GroundReport, GroundReportConfig};
pub use irwin::Irwin;
pub use predicate::{FieldListConfig, PredicateSpatial, SingleFieldConfig};
pub use report::{Facts, Ics209};

use super::{AttributeReader, Attached, ConfigError, ConfigField, MethodConfig, MethodError, SkipReason};
use crate::model::{Attributes, Clump, DateRange, Fire, RawData, SourceId};
use crate::queryable::{EntityKey, FireSet};

const NUM_FORWARD_DAYS: ConfigField = ConfigField {
    name: "numForwardDays",
    description: "Days after a clump in which an existing fire still matches",
};

const NUM_BACKWARD_DAYS: ConfigField = ConfigField {
    name: "numBackwardDays",
    description: "Days before a clump in which an existing fire still matches",
};

const ASSOCIATION_FIELD: ConfigField = ConfigField {
    name: "associationField",
    description: "Attribute identifying the incident a report belongs to",
};

/// Days around a clump searched for candidate fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub forward_days: i64,
    pub backward_days: i64,
}

impl Window {
    fn read(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        let forward_days: i64 = attrs.parse(NUM_FORWARD_DAYS.name)?;
        let backward_days: i64 = attrs.parse(NUM_BACKWARD_DAYS.name)?;
        if forward_days < 0 {
            return Err(attrs.invalid(NUM_FORWARD_DAYS.name, &forward_days.to_string()));
        }
        if backward_days < 0 {
            return Err(attrs.invalid(NUM_BACKWARD_DAYS.name, &backward_days.to_string()));
        }
        Ok(Self {
            forward_days,
            backward_days,
        })
    }

    pub fn around(&self, clump: &Clump) -> DateRange {
        clump.range.widen(self.backward_days, self.forward_days)
    }
}

impl MethodConfig for Window {
    const FIELDS: &'static [ConfigField] = &[NUM_FORWARD_DAYS, NUM_BACKWARD_DAYS];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Window::read(attrs)
    }
}

/// The record a report-style clump was built from.
fn first_report(clump: &Clump) -> Result<RawData, SkipReason> {
    clump.raw_data.first().cloned().ok_or(SkipReason::NoRawData)
}

/// No candidates: a fresh fire. One: that fire. Several: their merge.
fn resolve(fires: &mut FireSet<'_>, mut candidates: Vec<EntityKey>, source: &SourceId) -> Result<Attached, MethodError> {
    candidates.sort();
    candidates.dedup();
    match candidates.as_slice() {
        [] => Ok(Attached {
            key: fires.add(Fire::new(source.clone())),
            created: true,
        }),
        [only] => Ok(Attached {
            key: *only,
            created: false,
        }),
        _ => Ok(Attached {
            key: fires.merge(&candidates)?,
            created: false,
        }),
    }
}

fn fire_mut<'a>(fires: &'a mut FireSet<'_>, key: EntityKey) -> Result<&'a mut Fire, MethodError> {
    fires
        .get_mut(key)
        .ok_or_else(|| MethodError::InvalidData(format!("fire {key:?} left the set")))
}

/// Copy attributes the fire does not have yet.
fn fill_missing(attrs: &mut Attributes, from: &Attributes) {
    for (name, value) in from {
        attrs.entry(name.clone()).or_insert_with(|| value.clone());
    }
}

/// Case-insensitive comparison of a fire attribute with a report identifier, both trimmed.
fn matches_identifier(fire: &Fire, field: &str, identifier: &str) -> bool {
    fire.attributes
        .get(field)
        .is_some_and(|value| value.trim().to_lowercase() == identifier.trim().to_lowercase())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::repository::FireRepository;
    use crate::store::InMemoryStore;

    #[test]
    fn window_rejects_negative_days() {
        let attrs: Attributes = [("numForwardDays", "-1"), ("numBackwardDays", "2")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let reader = AttributeReader::new("daily_area", &attrs);
        assert!(matches!(
            Window::from_attributes(&reader),
            Err(ConfigError::InvalidAttribute {
                attribute: "numForwardDays",
                ..
            })
        ));
    }

    #[test]
    fn resolve_creates_reuses_and_merges() {
        let store = InMemoryStore::new();
        stored_fire(&store, vec![report(0.0, 10.0, "2024-01-01", 1.0, &[])], &[]);
        stored_fire(&store, vec![report(100.0, 10.0, "2024-01-01", 1.0, &[])], &[]);
        let repo: &dyn FireRepository = &store;
        let mut fires = FireSet::new(repo, source());

        let fresh = resolve(&mut fires, Vec::new(), &source()).unwrap();
        assert!(fresh.created);

        let keys = fires.get_by_date(on_day("2024-01-01")).unwrap();
        assert_eq!(keys.len(), 2);
        let one = resolve(&mut fires, vec![keys[0], keys[0]], &source()).unwrap();
        assert_eq!(one.key, keys[0]);
        assert!(!one.created);

        let merged = resolve(&mut fires, keys.clone(), &source()).unwrap();
        assert_eq!(fires.get(merged.key).unwrap().clumps().len(), 2);
        assert!(fires.get(keys[0]).is_none());
    }

    #[test]
    fn identifiers_compare_trimmed_and_caseless() {
        let mut fire = Fire::new(source());
        fire.attributes.insert("IrwinID".into(), " ABC-1 ".into());
        assert!(matches_identifier(&fire, "IrwinID", "abc-1"));
        assert!(!matches_identifier(&fire, "Other", "abc-1"));
    }

    #[test]
    fn fill_missing_keeps_existing() {
        let mut attrs: Attributes = [("a".to_string(), "1".to_string())].into();
        let from: Attributes = [("a".to_string(), "2".to_string()), ("b".to_string(), "3".to_string())].into();
        fill_missing(&mut attrs, &from);
        assert_eq!(attrs["a"], "1");
        assert_eq!(attrs["b"], "3");
    }
}
