use super::{
    ASSOCIATION_FIELD, AttributeReader, ConfigError, ConfigField, MethodConfig, MethodError, NUM_BACKWARD_DAYS,
    NUM_FORWARD_DAYS, Window, fill_missing, fire_mut, first_report, matches_identifier, resolve,
};
use crate::geometry;
use crate::model::Clump;
use crate::queryable::FireSet;
use crate::strategy::{Association, AssociationMethod, SkipReason};

/// A window and one identifying attribute.
pub struct SingleFieldConfig {
    pub window: Window,
    pub field: String,
}

impl MethodConfig for SingleFieldConfig {
    const FIELDS: &'static [ConfigField] = &[NUM_FORWARD_DAYS, NUM_BACKWARD_DAYS, ASSOCIATION_FIELD];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            window: Window::read(attrs)?,
            field: attrs.string(ASSOCIATION_FIELD.name)?,
        })
    }
}

/// A window and a comma-separated list of identifying attributes.
pub struct FieldListConfig {
    pub window: Window,
    pub fields: Vec<String>,
}

impl MethodConfig for FieldListConfig {
    const FIELDS: &'static [ConfigField] = &[NUM_FORWARD_DAYS, NUM_BACKWARD_DAYS, ASSOCIATION_FIELD];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        let raw = attrs.string(ASSOCIATION_FIELD.name)?;
        let fields: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        if fields.is_empty() {
            return Err(attrs.invalid(ASSOCIATION_FIELD.name, &raw));
        }
        Ok(Self {
            window: Window::read(attrs)?,
            fields,
        })
    }
}

/// Perimeters matched either by a shared identifier or by overlapping an existing fire.
/// The fire's area is the area of its combined shape.
pub struct PredicateSpatial {
    window: Window,
    fields: Vec<String>,
}

impl PredicateSpatial {
    pub fn mtbs(config: SingleFieldConfig) -> Self {
        Self {
            window: config.window,
            fields: vec![config.field],
        }
    }

    pub fn geomac_shapefile(config: FieldListConfig) -> Self {
        Self {
            window: config.window,
            fields: config.fields,
        }
    }
}

impl AssociationMethod for PredicateSpatial {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError> {
        let report = match first_report(&clump) {
            Ok(report) => report,
            Err(skip) => return Ok(Err(skip)),
        };
        let identifiers: Vec<(&str, &str)> = self
            .fields
            .iter()
            .filter_map(|field| {
                let value = report.attr(field)?.trim();
                (!value.is_empty()).then_some((field.as_str(), value))
            })
            .collect();
        if identifiers.is_empty() {
            return Ok(Err(SkipReason::MissingField(self.fields.join(","))));
        }

        let window = self.window.around(&clump);
        let mut candidates = fires.get_matching(window, |fire| {
            identifiers
                .iter()
                .any(|(field, identifier)| matches_identifier(fire, field, identifier))
        })?;
        candidates.extend(fires.get_associated(&clump.shape, window)?);
        let attached = resolve(fires, candidates, &clump.source)?;

        let fire = fire_mut(fires, attached.key)?;
        fire.add_clump(clump)?;
        fire.area = geometry::area(&fire.shape);
        fill_missing(&mut fire.attributes, &report.attributes);
        Ok(Ok(attached))
    }
}
