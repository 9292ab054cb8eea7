//! Acquisition: turning a source's published data into `RawData` records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use geo::{Coord, Geometry, LineString, Point, Polygon};
use serde::Deserialize;
use tracing::debug;

use super::{AttributeReader, ConfigError, ConfigField, MethodConfig};
use crate::granularity::{format_compact_day, parse_day};
use crate::limits::{MAX_RECORDS_PER_ACQUIRE, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::{Attributes, DAY_MS, DateRange, Ms, RawData, Source};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Reading the data failed. Worth retrying.
    Io(String),
    /// The data is malformed. Retrying will not help.
    Parse { line: usize, message: String },
}

impl AcquireError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AcquireError::Io(_))
    }
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::Io(e) => write!(f, "I/O error: {e}"),
            AcquireError::Parse { line, message } => write!(f, "line {line}: {message}"),
        }
    }
}

impl std::error::Error for AcquireError {}

/// Pulls a source's data for the day containing `at`.
pub trait FetchMethod: Send + Sync {
    fn fetch(&self, source: &Source, at: Ms) -> Result<Vec<RawData>, AcquireError>;
}

/// Reads a manually uploaded file.
pub trait IngestMethod: Send + Sync {
    fn ingest(&self, source: &Source, path: &Path) -> Result<Vec<RawData>, AcquireError>;
}

// ── JSON lines ──────────────────────────────────────────────────

/// One line of a JSON-lines data file.
#[derive(Debug, Deserialize)]
struct Record {
    x: Option<f64>,
    y: Option<f64>,
    /// Exterior ring as `[x, y]` pairs.
    polygon: Option<Vec<[f64; 2]>>,
    start: String,
    end: Option<String>,
    #[serde(default)]
    area: f64,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

/// An RFC 3339 instant, or a `YYYY-MM-DD` date meaning the whole UTC day.
fn parse_time(text: &str) -> Option<DateRange> {
    let text = text.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        let ms = t.timestamp_millis();
        return Some(DateRange::new(ms, ms));
    }
    parse_day(text).map(|start| DateRange::new(start, start + DAY_MS - 1))
}

fn shape_of(record: &Record) -> Result<Geometry<f64>, String> {
    if let Some(ring) = &record.polygon {
        if ring.len() < 3 {
            return Err(format!("polygon needs at least 3 points, got {}", ring.len()));
        }
        let coords: Vec<Coord<f64>> = ring.iter().map(|[x, y]| Coord { x: *x, y: *y }).collect();
        return Ok(Geometry::Polygon(Polygon::new(LineString::new(coords), Vec::new())));
    }
    match (record.x, record.y) {
        (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Ok(Geometry::Point(Point::new(x, y))),
        (Some(_), Some(_)) => Err("non-finite coordinates".into()),
        _ => Err("record has neither x/y nor polygon".into()),
    }
}

fn attributes_of(values: BTreeMap<String, serde_json::Value>) -> Attributes {
    values
        .into_iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((name, s)),
            other => Some((name, other.to_string())),
        })
        .collect()
}

fn to_raw_data(source: &Source, record: Record) -> Result<RawData, String> {
    let start = parse_time(&record.start).ok_or_else(|| format!("bad start time {:?}", record.start))?;
    let end = match &record.end {
        Some(text) => parse_time(text).ok_or_else(|| format!("bad end time {text:?}"))?,
        None => start,
    };
    let range = DateRange::new(start.start, end.end.max(start.start));
    if range.start < MIN_VALID_TIMESTAMP_MS || range.end > MAX_VALID_TIMESTAMP_MS {
        return Err(format!("time range {}..{} out of bounds", range.start, range.end));
    }
    if !record.area.is_finite() || record.area < 0.0 {
        return Err(format!("bad area {}", record.area));
    }
    let shape = shape_of(&record)?;
    let mut raw = RawData::new(source.id.clone(), shape, record.area, range);
    raw.attributes = attributes_of(record.attributes);
    Ok(raw)
}

/// Parse JSON-lines text. Blank lines and `#` comments are ignored.
pub fn parse_json_lines(source: &Source, text: &str) -> Result<Vec<RawData>, AcquireError> {
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parse_error = |message: String| AcquireError::Parse {
            line: index + 1,
            message,
        };
        let record: Record = serde_json::from_str(line).map_err(|e| parse_error(e.to_string()))?;
        records.push(to_raw_data(source, record).map_err(parse_error)?);
        if records.len() > MAX_RECORDS_PER_ACQUIRE {
            return Err(parse_error(format!("more than {MAX_RECORDS_PER_ACQUIRE} records")));
        }
    }
    Ok(records)
}

fn read(path: &Path) -> Result<String, AcquireError> {
    std::fs::read_to_string(path).map_err(|e| AcquireError::Io(format!("{}: {e}", path.display())))
}

/// Upload ingest of a JSON-lines file.
pub struct JsonLinesIngest;

impl IngestMethod for JsonLinesIngest {
    fn ingest(&self, source: &Source, path: &Path) -> Result<Vec<RawData>, AcquireError> {
        parse_json_lines(source, &read(path)?)
    }
}

// ── File drop ───────────────────────────────────────────────────

const DIRECTORY: ConfigField = ConfigField {
    name: "directory",
    description: "Directory where daily files named <source>-<YYYYMMDD>.jsonl are dropped",
};

pub struct FileDropConfig {
    pub directory: PathBuf,
}

impl MethodConfig for FileDropConfig {
    const FIELDS: &'static [ConfigField] = &[DIRECTORY];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            directory: PathBuf::from(attrs.string(DIRECTORY.name)?),
        })
    }
}

/// Fetch from daily JSON-lines files dropped into a directory by an external process.
pub struct FileDropFetch {
    directory: PathBuf,
}

impl FileDropFetch {
    pub fn new(config: FileDropConfig) -> Self {
        Self {
            directory: config.directory,
        }
    }

    pub fn path_for(&self, source: &Source, at: Ms) -> PathBuf {
        self.directory
            .join(format!("{}-{}.jsonl", source.id, format_compact_day(at)))
    }
}

impl FetchMethod for FileDropFetch {
    fn fetch(&self, source: &Source, at: Ms) -> Result<Vec<RawData>, AcquireError> {
        let path = self.path_for(source, at);
        if !path.exists() {
            debug!("no file at {}", path.display());
            return Ok(Vec::new());
        }
        parse_json_lines(source, &read(&path)?)
    }
}
