use super::{
    AttributeReader, ConfigError, ConfigField, MethodConfig, MethodError, NUM_BACKWARD_DAYS, NUM_FORWARD_DAYS, Window,
    fill_missing, fire_mut, first_report,
};
use crate::geometry::buffer_shape;
use crate::model::{Clump, Fire};
use crate::queryable::FireSet;
use crate::strategy::{Association, AssociationMethod, Attached, SkipReason};

const FIRE_NAME: &str = "firename";

const FIRE_DISTANCE: ConfigField = ConfigField {
    name: "fireDistance",
    description: "Search distance around a reported fire (meters)",
};

const NUM_REPEATED_DAYS: ConfigField = ConfigField {
    name: "numRepeatedDays",
    description: "Reports repeating an unchanged area more often than this are dropped",
};

pub struct GroundReportConfig {
    pub window: Window,
    pub fire_distance: f64,
    pub num_repeated_days: usize,
}

impl MethodConfig for GroundReportConfig {
    const FIELDS: &'static [ConfigField] = &[NUM_FORWARD_DAYS, NUM_BACKWARD_DAYS, FIRE_DISTANCE, NUM_REPEATED_DAYS];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            window: Window::read(attrs)?,
            fire_distance: attrs.parse(FIRE_DISTANCE.name)?,
            num_repeated_days: attrs.parse(NUM_REPEATED_DAYS.name)?,
        })
    }
}

/// Daily ground reports of named fires. Each fire holds only its latest report; repeats of an
/// unchanged area and reports older than the fire are dropped.
pub struct GroundReport {
    config: GroundReportConfig,
}

impl GroundReport {
    pub fn new(config: GroundReportConfig) -> Self {
        Self { config }
    }
}

impl AssociationMethod for GroundReport {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError> {
        let report = match first_report(&clump) {
            Ok(report) => report,
            Err(skip) => return Ok(Err(skip)),
        };
        let query = buffer_shape(&clump.shape, self.config.fire_distance)?;
        let candidates = fires.get_associated(&query, self.config.window.around(&clump))?;

        let attached = match candidates.as_slice() {
            [] => {
                let mut fire = Fire::new(clump.source.clone());
                fire.area = clump.area;
                fire.add_clump(clump.clone())?;
                Attached {
                    key: fires.add(fire),
                    created: true,
                }
            }
            [only] => Attached {
                key: *only,
                created: false,
            },
            _ => {
                let name = report.attr(FIRE_NAME).unwrap_or_default();
                let named = candidates
                    .iter()
                    .copied()
                    .find(|&key| fires.get(key).is_some_and(|f| f.display_name == name));
                match named {
                    Some(key) => Attached { key, created: false },
                    None => {
                        return Ok(Err(SkipReason::AmbiguousCandidates {
                            field: FIRE_NAME.to_string(),
                            value: name.to_string(),
                            candidates: candidates.len(),
                        }));
                    }
                }
            }
        };

        let fire = fire_mut(fires, attached.key)?;
        if !attached.created {
            let repeats = fire.clumps().iter().filter(|c| c.area == fire.area).count();
            if clump.area <= fire.area && repeats > self.config.num_repeated_days {
                return Ok(Err(SkipReason::UnchangedArea));
            }
        }

        let newer = fire.range().is_some_and(|r| report.range.end > r.end);
        if newer {
            fire.attributes.extend(report.attributes);
        } else {
            fill_missing(&mut fire.attributes, &report.attributes);
        }
        if attached.created {
            return Ok(Ok(attached));
        }
        if !newer {
            return Ok(Err(SkipReason::StaleReport));
        }
        fire.remove_clumps();
        fire.add_clump(clump)?;
        fire.area = report.area;
        Ok(Ok(attached))
    }
}
