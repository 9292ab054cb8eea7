use super::{
    AttributeReader, ConfigError, ConfigField, MethodConfig, MethodError, NUM_BACKWARD_DAYS, NUM_FORWARD_DAYS, Window,
    fill_missing, fire_mut, first_report, resolve,
};
use crate::geometry::{self, buffer_shape};
use crate::model::{Clump, Fire};
use crate::queryable::FireSet;
use crate::strategy::{Association, AssociationMethod};

const SIZE_THRESHOLD: ConfigField = ConfigField {
    name: "sizeThreshold",
    description: "Clumps larger than this (square meters) use the large fire distance",
};

const SMALL_FIRE_DISTANCE: ConfigField = ConfigField {
    name: "smallFireDistance",
    description: "Search distance around small clumps (meters)",
};

const LARGE_FIRE_DISTANCE: ConfigField = ConfigField {
    name: "largeFireDistance",
    description: "Search distance around large clumps (meters)",
};

const PIXEL_THRESHOLD: ConfigField = ConfigField {
    name: "pixelThreshold",
    description: "Fires with more detections than this use their geometric area",
};

pub struct DailyAreaConfig {
    pub window: Window,
    pub size_threshold: f64,
    pub small_fire_distance: f64,
    pub large_fire_distance: f64,
}

impl MethodConfig for DailyAreaConfig {
    const FIELDS: &'static [ConfigField] = &[
        NUM_FORWARD_DAYS,
        NUM_BACKWARD_DAYS,
        SIZE_THRESHOLD,
        SMALL_FIRE_DISTANCE,
        LARGE_FIRE_DISTANCE,
    ];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            window: Window::read(attrs)?,
            size_threshold: attrs.parse(SIZE_THRESHOLD.name)?,
            small_fire_distance: attrs.parse(SMALL_FIRE_DISTANCE.name)?,
            large_fire_distance: attrs.parse(LARGE_FIRE_DISTANCE.name)?,
        })
    }
}

pub struct CwfisAreaConfig {
    pub daily: DailyAreaConfig,
    pub pixel_threshold: usize,
}

impl MethodConfig for CwfisAreaConfig {
    const FIELDS: &'static [ConfigField] = &[
        NUM_FORWARD_DAYS,
        NUM_BACKWARD_DAYS,
        SIZE_THRESHOLD,
        SMALL_FIRE_DISTANCE,
        LARGE_FIRE_DISTANCE,
        PIXEL_THRESHOLD,
    ];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            daily: DailyAreaConfig::from_attributes(attrs)?,
            pixel_threshold: attrs.parse(PIXEL_THRESHOLD.name)?,
        })
    }
}

/// How a fire's area follows from its clumps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AreaRule {
    /// Sum of clump areas.
    ClumpSum,
    /// Sum of clump areas up to `n` detections, geometric area beyond.
    PixelThreshold(usize),
}

impl AreaRule {
    fn area(&self, fire: &Fire) -> f64 {
        let summed = || fire.clumps().iter().map(|c| c.area).sum::<f64>();
        match *self {
            AreaRule::ClumpSum => summed(),
            AreaRule::PixelThreshold(n) if fire.raw_data().count() <= n => summed(),
            AreaRule::PixelThreshold(_) => geometry::area(&fire.shape),
        }
    }
}

/// Spatial association of daily detections: a clump joins every fire its buffered shape
/// touches within the window. Large clumps search further.
pub struct DailyArea {
    config: DailyAreaConfig,
    area: AreaRule,
}

impl DailyArea {
    pub fn new(config: DailyAreaConfig) -> Self {
        Self {
            config,
            area: AreaRule::ClumpSum,
        }
    }

    pub fn cwfis(config: CwfisAreaConfig) -> Self {
        Self {
            config: config.daily,
            area: AreaRule::PixelThreshold(config.pixel_threshold),
        }
    }
}

impl AssociationMethod for DailyArea {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError> {
        let report = match first_report(&clump) {
            Ok(report) => report,
            Err(skip) => return Ok(Err(skip)),
        };
        let distance = if clump.area > self.config.size_threshold {
            self.config.large_fire_distance
        } else {
            self.config.small_fire_distance
        };
        let query = buffer_shape(&clump.shape, distance)?;
        let candidates = fires.get_associated(&query, self.config.window.around(&clump))?;
        let attached = resolve(fires, candidates, &clump.source)?;

        let fire = fire_mut(fires, attached.key)?;
        fire.add_clump(clump)?;
        fire.area = self.area.area(fire);
        fill_missing(&mut fire.attributes, &report.attributes);
        Ok(Ok(attached))
    }
}

/// Perimeter association: unbuffered overlap, and the fire keeps its largest perimeter's area.
pub struct GeoMac {
    window: Window,
}

impl GeoMac {
    pub fn new(window: Window) -> Self {
        Self { window }
    }
}

impl AssociationMethod for GeoMac {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError> {
        let report = match first_report(&clump) {
            Ok(report) => report,
            Err(skip) => return Ok(Err(skip)),
        };
        let candidates = fires.get_associated(&clump.shape, self.window.around(&clump))?;
        let attached = resolve(fires, candidates, &clump.source)?;

        let fire = fire_mut(fires, attached.key)?;
        fire.add_clump(clump)?;
        fire.area = fire.clumps().iter().map(|c| c.area).fold(0.0, f64::max);
        fill_missing(&mut fire.attributes, &report.attributes);
        Ok(Ok(attached))
    }
}
