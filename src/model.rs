use std::collections::BTreeMap;

use geo::{Geometry, MultiPolygon};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::geometry::{self, GeometryError, union_all, union_pair};
use crate::granularity::{Granularity, day_start};

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Closed interval `[start, end]`: both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Ms,
    pub end: Ms,
}

impl DateRange {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// The UTC day containing `t`.
    pub fn day(t: Ms) -> Self {
        let start = day_start(t);
        Self::new(start, start + DAY_MS - 1)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &DateRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &DateRange) -> DateRange {
        DateRange::new(self.start.min(other.start), self.end.max(other.end))
    }

    pub fn widen(&self, back_days: i64, forward_days: i64) -> DateRange {
        DateRange::new(
            self.start.saturating_sub(back_days.saturating_mul(DAY_MS)),
            self.end.saturating_add(forward_days.saturating_mul(DAY_MS)),
        )
    }

    /// Hull of every range yielded, `None` when empty.
    pub fn hull(ranges: impl IntoIterator<Item = DateRange>) -> Option<DateRange> {
        ranges.into_iter().reduce(|a, b| a.union(&b))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        SourceId(s.to_string())
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        StreamId(s.to_string())
    }
}

/// Free-form string attributes carried by records, clumps, fires and events.
pub type Attributes = BTreeMap<String, String>;

pub const UNKNOWN_FIRE_NAME: &str = "Unknown Fire";
pub const UNNAMED_PRESCRIBED_FIRE_NAME: &str = "Unnamed Prescribed Fire";
pub const PLANNED_INITIATION_DATE: &str = "Planned Initiation Date";
pub const WILDFIRE: &str = "WF";
pub const PRESCRIBED_FIRE: &str = "RX";
pub const UNKNOWN_FIRE_TYPE: &str = "NA";

// ── Catalog ─────────────────────────────────────────────────────

/// How much a stream trusts one source, per reconciled field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Weighting {
    pub detection_rate: f64,
    pub false_alarm_rate: f64,
    pub growth_weight: f64,
    pub location_weight: f64,
    pub shape_weight: f64,
    pub size_weight: f64,
    pub name_weight: f64,
    pub type_weight: f64,
    /// Kilometres.
    pub location_uncertainty: f64,
    /// Days.
    pub start_date_uncertainty: i64,
    /// Days.
    pub end_date_uncertainty: i64,
}

impl Default for Weighting {
    fn default() -> Self {
        Self {
            detection_rate: 1.0,
            false_alarm_rate: 0.0,
            growth_weight: 1.0,
            location_weight: 1.0,
            shape_weight: 1.0,
            size_weight: 1.0,
            name_weight: 1.0,
            type_weight: 1.0,
            location_uncertainty: 0.0,
            start_date_uncertainty: 0,
            end_date_uncertainty: 0,
        }
    }
}

/// What an acquisition does with previously stored raw data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPolicy {
    /// Delete stored raw data in the fetched date range.
    #[default]
    Replace,
    /// Delete stored raw data in range that carries one of the fetched IrwinIDs.
    IrwinReplace,
    Append,
}

fn default_method() -> String {
    "default".into()
}

fn default_ingest_method() -> String {
    "json_lines".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    #[serde(default = "default_method")]
    pub clump_method: String,
    #[serde(default = "default_method")]
    pub assoc_method: String,
    #[serde(default = "default_method")]
    pub probability_method: String,
    #[serde(default = "default_method")]
    pub fire_type_method: String,
    #[serde(default = "default_ingest_method")]
    pub ingest_method: String,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub new_data_policy: DataPolicy,
    #[serde(default)]
    pub latest_data: Option<Ms>,
    /// `;`-separated attribute names joined into a fire's display name.
    #[serde(default)]
    pub fire_name_field: String,
    #[serde(default)]
    pub default_weighting: Weighting,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Source {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: SourceId(id.into()),
            name: name.into(),
            clump_method: default_method(),
            assoc_method: default_method(),
            probability_method: default_method(),
            fire_type_method: default_method(),
            ingest_method: default_ingest_method(),
            granularity: Granularity::default(),
            new_data_policy: DataPolicy::default(),
            latest_data: None,
            fire_name_field: String::new(),
            default_weighting: Weighting::default(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl ToString) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationStream {
    pub id: StreamId,
    pub name: String,
    #[serde(default)]
    pub auto_reconcile: bool,
    #[serde(default = "default_method")]
    pub reconciliation_method: String,
    #[serde(default)]
    pub weightings: BTreeMap<SourceId, Weighting>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ReconciliationStream {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: StreamId(id.into()),
            name: name.into(),
            auto_reconcile: true,
            reconciliation_method: default_method(),
            weightings: BTreeMap::new(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_source(mut self, source: &SourceId, weighting: Weighting) -> Self {
        self.weightings.insert(source.clone(), weighting);
        self
    }

    pub fn weighting(&self, source: &SourceId) -> Option<&Weighting> {
        self.weightings.get(source)
    }

    pub fn includes(&self, source: &SourceId) -> bool {
        self.weightings.contains_key(source)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceId> {
        self.weightings.keys()
    }
}

/// A recurring fetch: the trigger time minus `date_offset` days is what gets acquired.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledFetch {
    pub name: String,
    pub source: SourceId,
    pub fetch_method: String,
    #[serde(default)]
    pub date_offset: i64,
    #[serde(default)]
    pub attributes: Attributes,
}

// ── Pipeline entities ───────────────────────────────────────────

/// One detection or report as acquired from a source.
#[derive(Debug, Clone)]
pub struct RawData {
    pub id: Ulid,
    pub source: SourceId,
    pub shape: Geometry<f64>,
    /// Square metres reported by the source, 0 when unknown.
    pub area: f64,
    pub range: DateRange,
    pub attributes: Attributes,
    pub clump: Option<Ulid>,
}

impl RawData {
    pub fn new(source: SourceId, shape: Geometry<f64>, area: f64, range: DateRange) -> Self {
        Self {
            id: Ulid::new(),
            source,
            shape,
            area,
            range,
            attributes: Attributes::new(),
            clump: None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Spatially connected raw data from one source.
#[derive(Debug, Clone)]
pub struct Clump {
    pub id: Ulid,
    pub source: SourceId,
    pub shape: MultiPolygon<f64>,
    pub area: f64,
    pub range: DateRange,
    pub raw_data: Vec<RawData>,
    pub fire: Option<Ulid>,
}

impl Clump {
    /// Members are linked to the new clump. `None` when `raw_data` is empty.
    pub fn new(source: SourceId, shape: MultiPolygon<f64>, area: f64, mut raw_data: Vec<RawData>) -> Option<Self> {
        let range = DateRange::hull(raw_data.iter().map(|r| r.range))?;
        let id = Ulid::new();
        for raw in &mut raw_data {
            raw.clump = Some(id);
        }
        Some(Self {
            id,
            source,
            shape,
            area,
            range,
            raw_data,
            fire: None,
        })
    }
}

/// Area of a fire on one UTC day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireDay {
    pub date: Ms,
    pub area: f64,
}

/// A fire as tracked over time by one source.
#[derive(Debug, Clone)]
pub struct Fire {
    pub id: Option<Ulid>,
    pub source: SourceId,
    pub shape: MultiPolygon<f64>,
    pub area: f64,
    pub fire_type: String,
    pub probability: f64,
    pub display_name: String,
    pub attributes: Attributes,
    clumps: Vec<Clump>,
    range: Option<DateRange>,
}

impl Fire {
    pub fn new(source: SourceId) -> Self {
        Self {
            id: None,
            source,
            shape: geometry::empty(),
            area: 0.0,
            fire_type: UNKNOWN_FIRE_TYPE.into(),
            probability: 0.0,
            display_name: UNKNOWN_FIRE_NAME.into(),
            attributes: Attributes::new(),
            clumps: Vec::new(),
            range: None,
        }
    }

    pub fn clumps(&self) -> &[Clump] {
        &self.clumps
    }

    pub fn range(&self) -> Option<DateRange> {
        self.range
    }

    pub fn is_empty(&self) -> bool {
        self.clumps.is_empty()
    }

    pub fn raw_data(&self) -> impl Iterator<Item = &RawData> {
        self.clumps.iter().flat_map(|c| c.raw_data.iter())
    }

    /// Assign the persisted id and relink member clumps.
    pub fn set_id(&mut self, id: Ulid) {
        self.id = Some(id);
        for clump in &mut self.clumps {
            clump.fire = Some(id);
        }
    }

    /// Add a clump, replacing a member with the same id. The shape grows to cover it.
    pub fn add_clump(&mut self, mut clump: Clump) -> Result<(), GeometryError> {
        clump.fire = self.id;
        match self.clumps.iter().position(|c| c.id == clump.id) {
            Some(pos) => {
                self.clumps[pos] = clump;
                let shapes: Vec<MultiPolygon<f64>> = self.clumps.iter().map(|c| c.shape.clone()).collect();
                self.shape = union_all(&shapes)?;
            }
            None => {
                self.shape = union_pair(&self.shape, &clump.shape)?;
                self.clumps.push(clump);
            }
        }
        self.refresh_range();
        Ok(())
    }

    /// Detach every clump, leaving an empty fire.
    pub fn remove_clumps(&mut self) -> Vec<Clump> {
        self.shape = geometry::empty();
        self.range = None;
        let mut clumps = std::mem::take(&mut self.clumps);
        for clump in &mut clumps {
            clump.fire = None;
        }
        clumps
    }

    /// Take over every clump and attribute of `other`. Areas add up.
    pub fn absorb(&mut self, other: Fire) -> Result<(), GeometryError> {
        self.shape = union_pair(&self.shape, &other.shape)?;
        self.area += other.area;
        self.attributes.extend(other.attributes);
        for mut clump in other.clumps {
            clump.fire = self.id;
            self.clumps.push(clump);
        }
        self.refresh_range();
        Ok(())
    }

    fn refresh_range(&mut self) {
        self.range = DateRange::hull(self.clumps.iter().map(|c| c.range));
    }

    /// Rebuild the display name from the `;`-separated attribute names in `name_fields`.
    pub fn refresh_display_name(&mut self, name_fields: &str) {
        let parts: Vec<&str> = name_fields
            .split(';')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .filter_map(|field| self.attributes.get(field))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect();
        let mut name = parts.join(" - ");
        if name.is_empty() {
            name = if self.attributes.contains_key(PLANNED_INITIATION_DATE) {
                UNNAMED_PRESCRIBED_FIRE_NAME.to_string()
            } else {
                UNKNOWN_FIRE_NAME.to_string()
            };
        }
        let lower = name.to_lowercase();
        if !lower.contains("fire") && !lower.contains("complex") {
            name.push_str(" Fire");
        }
        self.display_name = name;
    }

    /// Per UTC day covered by member clumps, the area of the union of the clumps active that day.
    pub fn fire_days(&self) -> Result<Vec<FireDay>, GeometryError> {
        let Some(range) = self.range else {
            return Ok(Vec::new());
        };
        let mut days = Vec::new();
        let mut day = day_start(range.start);
        while day <= range.end {
            let window = DateRange::day(day);
            let shapes: Vec<MultiPolygon<f64>> = self
                .clumps
                .iter()
                .filter(|c| c.range.overlaps(&window))
                .map(|c| c.shape.clone())
                .collect();
            if !shapes.is_empty() {
                let shape = union_all(&shapes)?;
                days.push(FireDay {
                    date: day,
                    area: geometry::area(&shape),
                });
            }
            day += DAY_MS;
        }
        Ok(days)
    }
}

/// Area of an event on one UTC day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventDay {
    pub date: Ms,
    pub area: f64,
}

/// Fires from several sources reconciled into one real-world fire within a stream.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Option<Ulid>,
    pub stream: StreamId,
    pub display_name: String,
    pub shape: MultiPolygon<f64>,
    pub range: Option<DateRange>,
    pub total_area: f64,
    pub probability: f64,
    pub fire_type: String,
    pub attributes: Attributes,
    pub event_days: Vec<EventDay>,
    /// Reconciled field name to the source whose slice supplied it.
    pub weighting_sources: BTreeMap<String, SourceId>,
    fires: Vec<Fire>,
}

/// The fires of one source within an event, with that source's weighting.
#[derive(Debug)]
pub struct EventSlice<'a> {
    pub source: &'a SourceId,
    pub weighting: Weighting,
    pub fires: Vec<&'a Fire>,
}

impl Event {
    pub fn new(stream: StreamId) -> Self {
        Self {
            id: None,
            stream,
            display_name: String::new(),
            shape: geometry::empty(),
            range: None,
            total_area: 0.0,
            probability: 0.0,
            fire_type: UNKNOWN_FIRE_TYPE.into(),
            attributes: Attributes::new(),
            event_days: Vec::new(),
            weighting_sources: BTreeMap::new(),
            fires: Vec::new(),
        }
    }

    pub fn fires(&self) -> &[Fire] {
        &self.fires
    }

    /// Add a fire snapshot, replacing an older snapshot of the same fire.
    pub fn add_fire(&mut self, fire: Fire) {
        let existing = fire
            .id
            .and_then(|id| self.fires.iter().position(|f| f.id == Some(id)));
        match existing {
            Some(pos) => self.fires[pos] = fire,
            None => self.fires.push(fire),
        }
    }

    pub fn remove_fire(&mut self, id: Ulid) -> bool {
        let before = self.fires.len();
        self.fires.retain(|f| f.id != Some(id));
        self.fires.len() != before
    }

    pub fn absorb(&mut self, other: Event) {
        for fire in other.fires {
            self.add_fire(fire);
        }
        self.attributes.extend(other.attributes);
    }

    /// One slice per contributing source that `stream` weights, in order of first appearance.
    pub fn slices<'a>(&'a self, stream: &ReconciliationStream) -> Vec<EventSlice<'a>> {
        let mut slices: Vec<EventSlice<'a>> = Vec::new();
        for fire in &self.fires {
            if let Some(slice) = slices.iter_mut().find(|s| *s.source == fire.source) {
                slice.fires.push(fire);
                continue;
            }
            if let Some(weighting) = stream.weighting(&fire.source) {
                slices.push(EventSlice {
                    source: &fire.source,
                    weighting: *weighting,
                    fires: vec![fire],
                });
            }
        }
        slices
    }
}
