//! Pluggable per-source and per-stream algorithms, looked up by name in a `MethodRegistry`.

pub mod acquire;
pub mod assoc;
pub mod clump;
pub mod firetype;
pub mod probability;
pub mod reconcile;
pub mod registry;

use std::str::FromStr;

use crate::geometry::GeometryError;
use crate::job::progress::ProgressSink;
use crate::limits::MAX_ATTRIBUTE_LEN;
use crate::model::{Attributes, Clump, Fire, RawData, SourceId};
use crate::queryable::{EntityKey, EventSet, FireSet};
use crate::repository::StoreError;

pub use registry::MethodRegistry;

// ── Errors ──────────────────────────────────────────────────────

/// A method could not be built from its attribute bag. Raised before any job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownMethod {
        kind: &'static str,
        name: String,
    },
    MissingAttribute {
        method: String,
        attribute: &'static str,
    },
    InvalidAttribute {
        method: String,
        attribute: &'static str,
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownMethod { kind, name } => write!(f, "unknown {kind} method: {name}"),
            ConfigError::MissingAttribute { method, attribute } => {
                write!(f, "{method}: missing required attribute {attribute:?}")
            }
            ConfigError::InvalidAttribute {
                method,
                attribute,
                value,
            } => write!(f, "{method}: invalid value {value:?} for attribute {attribute:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A method failed in a way that should fail the job.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodError {
    Geometry(GeometryError),
    Store(StoreError),
    InvalidData(String),
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodError::Geometry(e) => write!(f, "geometry error: {e}"),
            MethodError::Store(e) => write!(f, "store error: {e}"),
            MethodError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for MethodError {}

impl From<GeometryError> for MethodError {
    fn from(e: GeometryError) -> Self {
        MethodError::Geometry(e)
    }
}

impl From<StoreError> for MethodError {
    fn from(e: StoreError) -> Self {
        MethodError::Store(e)
    }
}

/// Why a clump or fire was left out. Skips are logged and counted, never job failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoRawData,
    MissingField(String),
    /// An identifier matched several candidates and none could be chosen.
    AmbiguousCandidates {
        field: String,
        value: String,
        candidates: usize,
    },
    UnchangedArea,
    /// The report is not newer than the fire it matched.
    StaleReport,
    IncidentWithdrawn(String),
    NoWeighting(SourceId),
    EmptyFire,
}

impl SkipReason {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NoRawData => "no_raw_data",
            SkipReason::MissingField(_) => "missing_field",
            SkipReason::AmbiguousCandidates { .. } => "ambiguous_candidates",
            SkipReason::UnchangedArea => "unchanged_area",
            SkipReason::StaleReport => "stale_report",
            SkipReason::IncidentWithdrawn(_) => "incident_withdrawn",
            SkipReason::NoWeighting(_) => "no_weighting",
            SkipReason::EmptyFire => "empty_fire",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoRawData => write!(f, "no raw data"),
            SkipReason::MissingField(field) => write!(f, "missing field {field:?}"),
            SkipReason::AmbiguousCandidates {
                field,
                value,
                candidates,
            } => write!(f, "{candidates} candidates share {field}={value:?}"),
            SkipReason::UnchangedArea => write!(f, "area unchanged since last report"),
            SkipReason::StaleReport => write!(f, "report older than the matched fire"),
            SkipReason::IncidentWithdrawn(id) => write!(f, "incident {id} withdrawn"),
            SkipReason::NoWeighting(source) => write!(f, "no weighting for source {source}"),
            SkipReason::EmptyFire => write!(f, "fire has no clumps"),
        }
    }
}

/// Where a clump (or fire) ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    pub key: EntityKey,
    /// A new entity was created for it.
    pub created: bool,
}

pub type Association = Result<Attached, SkipReason>;
pub type Reconciliation = Result<Attached, SkipReason>;

// ── Configuration ───────────────────────────────────────────────

/// A named attribute a method reads from its configuration bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigField {
    pub name: &'static str,
    pub description: &'static str,
}

/// Typed configuration parsed once, when the method is built.
pub trait MethodConfig: Sized {
    const FIELDS: &'static [ConfigField];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError>;
}

/// For methods without attributes.
pub struct NoConfig;

impl MethodConfig for NoConfig {
    const FIELDS: &'static [ConfigField] = &[];

    fn from_attributes(_attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(NoConfig)
    }
}

/// Typed access to an attribute bag, producing `ConfigError`s that name the method.
pub struct AttributeReader<'a> {
    method: &'a str,
    attrs: &'a Attributes,
}

impl<'a> AttributeReader<'a> {
    pub fn new(method: &'a str, attrs: &'a Attributes) -> Self {
        Self { method, attrs }
    }

    fn raw(&self, name: &'static str) -> Result<Option<&'a str>, ConfigError> {
        let Some(value) = self.attrs.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        if value.len() > MAX_ATTRIBUTE_LEN {
            let head: String = value.chars().take(32).collect();
            return Err(self.invalid(name, &head));
        }
        Ok(Some(value))
    }

    /// An `InvalidAttribute` error naming this reader's method.
    pub fn invalid(&self, name: &'static str, value: &str) -> ConfigError {
        ConfigError::InvalidAttribute {
            method: self.method.to_string(),
            attribute: name,
            value: value.to_string(),
        }
    }

    pub fn string(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional_string(name)?.ok_or_else(|| ConfigError::MissingAttribute {
            method: self.method.to_string(),
            attribute: name,
        })
    }

    pub fn optional_string(&self, name: &'static str) -> Result<Option<String>, ConfigError> {
        Ok(self.raw(name)?.map(str::to_string))
    }

    pub fn parse<T: FromStr>(&self, name: &'static str) -> Result<T, ConfigError> {
        self.optional(name)?.ok_or_else(|| ConfigError::MissingAttribute {
            method: self.method.to_string(),
            attribute: name,
        })
    }

    pub fn optional<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError> {
        match self.raw(name)? {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| self.invalid(name, value)),
        }
    }
}

// ── Method contracts ────────────────────────────────────────────

/// Groups one batch of raw data into clumps.
pub trait ClumpMethod: Send + Sync {
    fn clump(&self, raw: Vec<RawData>, progress: &dyn ProgressSink) -> Result<Vec<Clump>, MethodError>;
}

/// Attaches one clump to a fire of the set, creating or merging fires as needed.
pub trait AssociationMethod: Send + Sync {
    fn associate(&self, clump: Clump, fires: &mut FireSet<'_>) -> Result<Association, MethodError>;
}

pub trait ProbabilityMethod: Send + Sync {
    fn fire_probability(&self, fire: &Fire) -> f64;
}

pub trait FireTypeMethod: Send + Sync {
    fn fire_type(&self, fire: &Fire) -> String;
}

/// Attaches one fire to an event of the set, creating or merging events as needed.
pub trait ReconciliationMethod: Send + Sync {
    fn reconcile(&self, fire: &Fire, events: &mut EventSet<'_>) -> Result<Reconciliation, MethodError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn reader_parses_and_reports() {
        let bag = attrs(&[("clumpRadius", " 500 "), ("bad", "x"), ("blank", "  ")]);
        let reader = AttributeReader::new("default", &bag);
        assert_eq!(reader.parse::<f64>("clumpRadius").unwrap(), 500.0);
        assert_eq!(reader.optional::<f64>("blank").unwrap(), None);
        assert_eq!(
            reader.parse::<f64>("missing").unwrap_err(),
            ConfigError::MissingAttribute {
                method: "default".into(),
                attribute: "missing"
            }
        );
        assert!(matches!(
            reader.parse::<i64>("bad"),
            Err(ConfigError::InvalidAttribute { attribute: "bad", .. })
        ));
    }

    #[test]
    fn oversized_attribute_rejected() {
        let long = "x".repeat(MAX_ATTRIBUTE_LEN + 1);
        let bag = attrs(&[("name", &long)]);
        let reader = AttributeReader::new("m", &bag);
        assert!(matches!(reader.string("name"), Err(ConfigError::InvalidAttribute { .. })));
    }

    #[test]
    fn skip_labels_are_distinct() {
        let reasons = [
            SkipReason::NoRawData,
            SkipReason::MissingField("x".into()),
            SkipReason::AmbiguousCandidates {
                field: "f".into(),
                value: "v".into(),
                candidates: 2,
            },
            SkipReason::UnchangedArea,
            SkipReason::StaleReport,
            SkipReason::IncidentWithdrawn("i".into()),
            SkipReason::NoWeighting(SourceId::from("s")),
            SkipReason::EmptyFire,
        ];
        let mut labels: Vec<&str> = reasons.iter().map(|r| r.label()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), reasons.len());
    }
}
