use std::collections::BTreeSet;
use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::repository::*;

/// On-disk catalog: the JSON document named by `EMBERLINE_CATALOG`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub streams: Vec<ReconciliationStream>,
    #[serde(default)]
    pub fetches: Vec<ScheduledFetch>,
}

impl CatalogFile {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))
    }
}

/// Process-local storage for every repository contract.
pub struct InMemoryStore {
    raw_data: DashMap<Ulid, RawData>,
    clumps: DashMap<Ulid, Clump>,
    fires: DashMap<Ulid, Fire>,
    events: DashMap<Ulid, Event>,
    sources: DashMap<SourceId, Source>,
    streams: DashMap<StreamId, ReconciliationStream>,
    fetches: DashMap<String, ScheduledFetch>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            raw_data: DashMap::new(),
            clumps: DashMap::new(),
            fires: DashMap::new(),
            events: DashMap::new(),
            sources: DashMap::new(),
            streams: DashMap::new(),
            fetches: DashMap::new(),
        }
    }

    pub fn with_catalog(catalog: CatalogFile) -> Self {
        let store = Self::new();
        info!(
            "catalog: {} sources, {} streams, {} scheduled fetches",
            catalog.sources.len(),
            catalog.streams.len(),
            catalog.fetches.len()
        );
        for source in catalog.sources {
            store.insert_source(source);
        }
        for stream in catalog.streams {
            store.insert_stream(stream);
        }
        for fetch in catalog.fetches {
            store.insert_fetch(fetch);
        }
        store
    }

    // ── Catalog CRUD ─────────────────────────────────────────

    pub fn insert_source(&self, source: Source) {
        self.sources.insert(source.id.clone(), source);
    }

    pub fn insert_stream(&self, stream: ReconciliationStream) {
        self.streams.insert(stream.id.clone(), stream);
    }

    pub fn insert_fetch(&self, fetch: ScheduledFetch) {
        self.fetches.insert(fetch.name.clone(), fetch);
    }

    // ── Inspection ───────────────────────────────────────────

    pub fn raw_data_count(&self) -> usize {
        self.raw_data.len()
    }

    pub fn clump_count(&self) -> usize {
        self.clumps.len()
    }

    pub fn fire(&self, id: &Ulid) -> Option<Fire> {
        self.fires.get(id).map(|e| e.value().clone())
    }

    pub fn clump(&self, id: &Ulid) -> Option<Clump> {
        self.clumps.get(id).map(|e| e.value().clone())
    }

    pub fn fires_of(&self, source: &SourceId) -> Vec<Fire> {
        self.fires
            .iter()
            .filter(|e| &e.value().source == source)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn events_of(&self, stream: &StreamId) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| &e.value().stream == stream)
            .map(|e| e.value().clone())
            .collect()
    }

    // ── Link maintenance ─────────────────────────────────────

    fn link_clumps(&self, fire: &Fire) {
        let Some(fire_id) = fire.id else { return };
        let members: BTreeSet<Ulid> = fire.clumps().iter().map(|c| c.id).collect();
        for mut entry in self.clumps.iter_mut() {
            let clump = entry.value_mut();
            if members.contains(&clump.id) {
                clump.fire = Some(fire_id);
            } else if clump.fire == Some(fire_id) {
                clump.fire = None;
            }
        }
        for clump in fire.clumps() {
            if !self.clumps.contains_key(&clump.id) {
                self.clumps.insert(clump.id, clump.clone());
            }
        }
    }

    fn unlink_fire(&self, fire_id: Ulid) {
        for mut entry in self.clumps.iter_mut() {
            if entry.value().fire == Some(fire_id) {
                entry.value_mut().fire = None;
            }
        }
        for mut entry in self.events.iter_mut() {
            entry.value_mut().remove_fire(fire_id);
        }
    }
}

// ── Raw data ─────────────────────────────────────────────────

impl RawDataRepository for InMemoryStore {
    fn get_by_date(&self, source: &SourceId, range: DateRange) -> Result<Vec<RawData>, StoreError> {
        Ok(self
            .raw_data
            .iter()
            .filter(|e| &e.value().source == source && e.value().range.overlaps(&range))
            .map(|e| e.value().clone())
            .collect())
    }

    fn save_all(&self, records: &[RawData]) -> Result<usize, StoreError> {
        for record in records {
            self.raw_data.insert(record.id, record.clone());
        }
        Ok(records.len())
    }

    fn delete_by_date(&self, source: &SourceId, range: DateRange) -> Result<usize, StoreError> {
        let before = self.raw_data.len();
        self.raw_data
            .retain(|_, r| !(&r.source == source && r.range.overlaps(&range)));
        Ok(before - self.raw_data.len())
    }

    fn delete_by_date_and_attribute(
        &self,
        source: &SourceId,
        range: DateRange,
        attribute: &str,
        values: &BTreeSet<String>,
    ) -> Result<usize, StoreError> {
        let before = self.raw_data.len();
        self.raw_data.retain(|_, r| {
            let hit = &r.source == source
                && r.range.overlaps(&range)
                && r.attributes.get(attribute).is_some_and(|v| values.contains(v));
            !hit
        });
        Ok(before - self.raw_data.len())
    }
}

// ── Clumps ───────────────────────────────────────────────────

impl ClumpRepository for InMemoryStore {
    fn get_by_date(&self, source: &SourceId, range: DateRange) -> Result<Vec<Clump>, StoreError> {
        Ok(self
            .clumps
            .iter()
            .filter(|e| &e.value().source == source && e.value().range.overlaps(&range))
            .map(|e| e.value().clone())
            .collect())
    }

    fn get_unassociated(&self, source: &SourceId, range: DateRange) -> Result<Vec<Clump>, StoreError> {
        let mut clumps: Vec<Clump> = self
            .clumps
            .iter()
            .filter(|e| {
                let c = e.value();
                &c.source == source && c.fire.is_none() && c.range.overlaps(&range)
            })
            .map(|e| e.value().clone())
            .collect();
        clumps.sort_by_key(|c| (c.range.start, c.id));
        Ok(clumps)
    }

    fn save(&self, clump: &Clump) -> Result<(), StoreError> {
        for raw in &clump.raw_data {
            if let Some(mut stored) = self.raw_data.get_mut(&raw.id) {
                stored.clump = Some(clump.id);
            }
        }
        self.clumps.insert(clump.id, clump.clone());
        Ok(())
    }
}

// ── Fires ────────────────────────────────────────────────────

impl Repository<Fire> for InMemoryStore {
    fn get_by_date(&self, source: &SourceId, range: DateRange) -> Result<Vec<Fire>, StoreError> {
        Ok(self
            .fires
            .iter()
            .filter(|e| {
                let f = e.value();
                &f.source == source && f.range().is_some_and(|r| r.overlaps(&range))
            })
            .map(|e| e.value().clone())
            .collect())
    }

    fn save(&self, fire: &mut Fire) -> Result<Ulid, StoreError> {
        let id = fire.id.unwrap_or_else(Ulid::new);
        fire.set_id(id);
        self.fires.insert(id, fire.clone());
        self.link_clumps(fire);
        Ok(id)
    }

    fn delete(&self, id: Ulid) -> Result<(), StoreError> {
        self.fires.remove(&id).ok_or(StoreError::NotFound(id))?;
        self.unlink_fire(id);
        Ok(())
    }

    fn merge(&self, fires: Vec<Fire>) -> Result<Fire, StoreError> {
        let source = match fires.first() {
            Some(first) => first.source.clone(),
            None => return Err(StoreError::MixedPartitions),
        };
        if fires.iter().any(|f| f.source != source) {
            return Err(StoreError::MixedPartitions);
        }
        let mut merged = Fire::new(source);
        for fire in fires {
            merged.absorb(fire)?;
        }
        debug!("merged fires into one with {} clumps", merged.clumps().len());
        Ok(merged)
    }
}

impl FireRepository for InMemoryStore {
    fn delete_orphaned(&self, source: &SourceId) -> Result<usize, StoreError> {
        let orphans: Vec<Ulid> = self
            .fires
            .iter()
            .filter(|e| &e.value().source == source && e.value().is_empty())
            .map(|e| *e.key())
            .collect();
        for id in &orphans {
            self.fires.remove(id);
            self.unlink_fire(*id);
        }
        Ok(orphans.len())
    }
}

// ── Events ───────────────────────────────────────────────────

impl Repository<Event> for InMemoryStore {
    fn get_by_date(&self, stream: &StreamId, range: DateRange) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .iter()
            .filter(|e| &e.value().stream == stream && e.value().range.is_some_and(|r| r.overlaps(&range)))
            .map(|e| e.value().clone())
            .collect())
    }

    fn save(&self, event: &mut Event) -> Result<Ulid, StoreError> {
        let id = *event.id.get_or_insert_with(Ulid::new);
        self.events.insert(id, event.clone());
        Ok(id)
    }

    fn delete(&self, id: Ulid) -> Result<(), StoreError> {
        self.events.remove(&id).map(|_| ()).ok_or(StoreError::NotFound(id))
    }

    fn merge(&self, events: Vec<Event>) -> Result<Event, StoreError> {
        let stream = match events.first() {
            Some(first) => first.stream.clone(),
            None => return Err(StoreError::MixedPartitions),
        };
        if events.iter().any(|e| e.stream != stream) {
            return Err(StoreError::MixedPartitions);
        }
        let mut merged = Event::new(stream);
        for event in events {
            merged.absorb(event);
        }
        Ok(merged)
    }
}

impl EventRepository for InMemoryStore {}

// ── Catalog ──────────────────────────────────────────────────

impl Catalog for InMemoryStore {
    fn source(&self, id: &SourceId) -> Result<Source, StoreError> {
        self.sources
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::UnknownSource(id.clone()))
    }

    fn sources(&self) -> Result<Vec<Source>, StoreError> {
        let mut sources: Vec<Source> = self.sources.iter().map(|e| e.value().clone()).collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sources)
    }

    fn stream(&self, id: &StreamId) -> Result<ReconciliationStream, StoreError> {
        self.streams
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::UnknownStream(id.clone()))
    }

    fn streams(&self) -> Result<Vec<ReconciliationStream>, StoreError> {
        let mut streams: Vec<ReconciliationStream> = self.streams.iter().map(|e| e.value().clone()).collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(streams)
    }

    fn scheduled_fetch(&self, name: &str) -> Result<ScheduledFetch, StoreError> {
        self.fetches
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::UnknownFetch(name.to_string()))
    }

    fn set_latest_data(&self, id: &SourceId, latest: Ms) -> Result<(), StoreError> {
        let mut source = self
            .sources
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSource(id.clone()))?;
        source.latest_data = Some(latest);
        Ok(())
    }
}
