use std::f64::consts::PI;

use geo::MultiPolygon;
use tracing::warn;

use super::{AttributeReader, ClumpMethod, ConfigError, ConfigField, MethodConfig, MethodError};
use crate::geometry::{self, GeometryError, buffer, dissolve, to_multi_polygon};
use crate::job::progress::{ProgressSink, fraction};
use crate::model::{Clump, RawData, SourceId};

const METERS_PER_HECTARE: f64 = 10_000.0;

/// Radius of a one-acre circle.
const ONE_ACRE_RADIUS_METERS: f64 = 35.890868;

const CLUMP_RADIUS: ConfigField = ConfigField {
    name: "clumpRadius",
    description: "Radius of the generated clump buffers (meters)",
};

const PIXEL_THRESHOLD: ConfigField = ConfigField {
    name: "pixelThreshold",
    description: "Clumps with more detections than this use their geometric area",
};

pub struct RadiusConfig {
    pub clump_radius: f64,
    pub pixel_threshold: Option<usize>,
}

impl MethodConfig for RadiusConfig {
    const FIELDS: &'static [ConfigField] = &[CLUMP_RADIUS, PIXEL_THRESHOLD];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        let clump_radius: f64 = attrs.parse(CLUMP_RADIUS.name)?;
        if !(clump_radius > 0.0 && clump_radius.is_finite()) {
            return Err(attrs.invalid(CLUMP_RADIUS.name, &clump_radius.to_string()));
        }
        Ok(Self {
            clump_radius,
            pixel_threshold: attrs.optional(PIXEL_THRESHOLD.name)?,
        })
    }
}

pub struct CwfisConfig {
    pub clump_radius: f64,
    pub pixel_threshold: usize,
}

impl MethodConfig for CwfisConfig {
    const FIELDS: &'static [ConfigField] = &[CLUMP_RADIUS, PIXEL_THRESHOLD];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        let radius = RadiusConfig::from_attributes(attrs)?;
        Ok(Self {
            clump_radius: radius.clump_radius,
            pixel_threshold: attrs.parse(PIXEL_THRESHOLD.name)?,
        })
    }
}

/// Buffer every detection and dissolve the buffers into clumps. Each detection counts as one
/// pixel of area `pi r^2`, unless the clump has more pixels than the threshold, in which case
/// its geometric area is used.
pub struct DefaultClump {
    source: SourceId,
    config: RadiusConfig,
}

impl DefaultClump {
    pub fn new(source: SourceId, config: RadiusConfig) -> Self {
        Self { source, config }
    }
}

impl ClumpMethod for DefaultClump {
    fn clump(&self, raw: Vec<RawData>, progress: &dyn ProgressSink) -> Result<Vec<Clump>, MethodError> {
        let area_per_pixel = PI * self.config.clump_radius * self.config.clump_radius;
        let groups = buffer_and_dissolve(raw, self.config.clump_radius, progress)?;
        Ok(groups
            .into_iter()
            .filter_map(|(shape, members)| {
                let pixels = members.len();
                let area = match self.config.pixel_threshold {
                    Some(threshold) if pixels > threshold => geometry::area(&shape),
                    _ => area_per_pixel * pixels as f64,
                };
                Clump::new(self.source.clone(), shape, area, members)
            })
            .collect())
    }
}

/// Like `DefaultClump`, but small clumps take the sum of the detections' `estarea` hectares.
pub struct CwfisClump {
    source: SourceId,
    config: CwfisConfig,
}

impl CwfisClump {
    pub fn new(source: SourceId, config: CwfisConfig) -> Self {
        Self { source, config }
    }
}

impl ClumpMethod for CwfisClump {
    fn clump(&self, raw: Vec<RawData>, progress: &dyn ProgressSink) -> Result<Vec<Clump>, MethodError> {
        let groups = buffer_and_dissolve(raw, self.config.clump_radius, progress)?;
        let mut clumps = Vec::with_capacity(groups.len());
        for (shape, members) in groups {
            let area = if members.len() <= self.config.pixel_threshold {
                estimated_area(&members)?
            } else {
                geometry::area(&shape)
            };
            clumps.extend(Clump::new(self.source.clone(), shape, area, members));
        }
        Ok(clumps)
    }
}

fn estimated_area(members: &[RawData]) -> Result<f64, MethodError> {
    let mut total = 0.0;
    for record in members {
        let value = record.attr("estarea").unwrap_or("");
        let hectares: f64 = value
            .trim()
            .parse()
            .map_err(|_| MethodError::InvalidData(format!("record {}: bad estarea {value:?}", record.id)))?;
        total += hectares * METERS_PER_HECTARE;
    }
    Ok(total)
}

fn buffer_and_dissolve(
    raw: Vec<RawData>,
    radius: f64,
    progress: &dyn ProgressSink,
) -> Result<Vec<(MultiPolygon<f64>, Vec<RawData>)>, MethodError> {
    let mut items = Vec::with_capacity(raw.len());
    for record in raw {
        let shape = buffer(&record.shape, radius)?;
        items.push((shape, record));
    }
    let dissolved = dissolve(items, progress)?;
    Ok(dissolved.into_iter().map(|d| (d.shape, d.members)).collect())
}

/// One clump per record, using the record's own polygon and area.
pub struct PerRecordClump {
    source: SourceId,
    /// Only the first record becomes a clump.
    first_only: bool,
}

impl PerRecordClump {
    pub fn geomac(source: SourceId) -> Self {
        Self {
            source,
            first_only: false,
        }
    }

    pub fn mtbs_dnbr(source: SourceId) -> Self {
        Self {
            source,
            first_only: true,
        }
    }
}

impl ClumpMethod for PerRecordClump {
    fn clump(&self, raw: Vec<RawData>, progress: &dyn ProgressSink) -> Result<Vec<Clump>, MethodError> {
        let total = if self.first_only { raw.len().min(1) } else { raw.len() };
        let mut clumps = Vec::with_capacity(total);
        for (n, record) in raw.into_iter().take(total).enumerate() {
            let Some(shape) = to_multi_polygon(&record.shape) else {
                warn!("record {} has no polygon shape; skipping", record.id);
                continue;
            };
            let area = record.area;
            clumps.extend(Clump::new(self.source.clone(), shape, area, vec![record]));
            progress.set_progress(fraction(n + 1, total, 0, 100), "Clumping records");
        }
        Ok(clumps)
    }
}

/// One clump per record: a circle whose area equals the reported area.
pub struct ReportedAreaClump {
    source: SourceId,
    min_radius: f64,
}

impl ReportedAreaClump {
    pub fn simple_data(source: SourceId) -> Self {
        Self { source, min_radius: 0.0 }
    }

    pub fn cwfis_ground_report(source: SourceId) -> Self {
        Self {
            source,
            min_radius: ONE_ACRE_RADIUS_METERS,
        }
    }
}

impl ClumpMethod for ReportedAreaClump {
    fn clump(&self, raw: Vec<RawData>, progress: &dyn ProgressSink) -> Result<Vec<Clump>, MethodError> {
        let total = raw.len();
        let mut clumps = Vec::with_capacity(total);
        for (n, record) in raw.into_iter().enumerate() {
            let radius = (record.area.max(0.0) / PI).sqrt().max(self.min_radius);
            let shape = match buffer(&record.shape, radius) {
                Ok(shape) => shape,
                Err(GeometryError::Unsupported(kind)) => {
                    warn!("record {}: cannot buffer {kind}; skipping", record.id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let area = record.area;
            clumps.extend(Clump::new(self.source.clone(), shape, area, vec![record]));
            progress.set_progress(fraction(n + 1, total, 0, 100), "Clumping records");
        }
        Ok(clumps)
    }
}
