//! A job-local, range-fetching cache of fires or events for one partition.
//!
//! A `QueryableSet` is owned by exactly one job execution and is not synchronised. Two jobs
//! that could touch the same entities never run at once because the queue serialises
//! conflicting jobs.

use std::collections::HashMap;

use geo::{BoundingRect, Intersects, MultiPolygon};
use ulid::Ulid;

use crate::geometry::envelope;
use crate::model::{DateRange, Event, Fire, SourceId, StreamId};
use crate::repository::{EventRepository, FireRepository, Repository, StoreError};

/// Anything a `QueryableSet` can hold.
pub trait Entity: Clone {
    type Partition: Clone + PartialEq + std::fmt::Debug;

    fn id(&self) -> Option<Ulid>;
    fn partition(&self) -> &Self::Partition;
    /// `None` while the entity has no dated members.
    fn date_range(&self) -> Option<DateRange>;
    fn shape(&self) -> &MultiPolygon<f64>;
}

impl Entity for Fire {
    type Partition = SourceId;

    fn id(&self) -> Option<Ulid> {
        self.id
    }

    fn partition(&self) -> &SourceId {
        &self.source
    }

    fn date_range(&self) -> Option<DateRange> {
        self.range()
    }

    fn shape(&self) -> &MultiPolygon<f64> {
        &self.shape
    }
}

impl Entity for Event {
    type Partition = StreamId;

    fn id(&self) -> Option<Ulid> {
        self.id
    }

    fn partition(&self) -> &StreamId {
        &self.stream
    }

    fn date_range(&self) -> Option<DateRange> {
        self.range
    }

    fn shape(&self) -> &MultiPolygon<f64> {
        &self.shape
    }
}

/// Stable handle to an entity within one set. Repeated queries for the same logical entity
/// return the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(usize);

struct Slot<E> {
    entity: E,
    dirty: bool,
}

pub struct QueryableSet<'r, E: Entity, R: Repository<E> + ?Sized> {
    repo: &'r R,
    partition: E::Partition,
    slots: Vec<Option<Slot<E>>>,
    by_id: HashMap<Ulid, EntityKey>,
    /// Persisted ids dropped from the set, deleted at save time.
    removed: Vec<Ulid>,
    watermark: Option<DateRange>,
    fetches: usize,
}

pub type FireSet<'r> = QueryableSet<'r, Fire, dyn FireRepository + 'r>;
pub type EventSet<'r> = QueryableSet<'r, Event, dyn EventRepository + 'r>;

impl<'r, E: Entity, R: Repository<E> + ?Sized> QueryableSet<'r, E, R> {
    pub fn new(repo: &'r R, partition: E::Partition) -> Self {
        Self {
            repo,
            partition,
            slots: Vec::new(),
            by_id: HashMap::new(),
            removed: Vec::new(),
            watermark: None,
            fetches: 0,
        }
    }

    pub fn partition(&self) -> &E::Partition {
        &self.partition
    }

    /// Date range already fetched from the repository.
    pub fn watermark(&self) -> Option<DateRange> {
        self.watermark
    }

    /// Repository fetches made so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.live().map(|(k, _)| k).collect()
    }

    pub fn get(&self, key: EntityKey) -> Option<&E> {
        self.slots.get(key.0)?.as_ref().map(|s| &s.entity)
    }

    /// Mutable access. The entity is written back on `save_new_entities`.
    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut E> {
        let slot = self.slots.get_mut(key.0)?.as_mut()?;
        slot.dirty = true;
        Some(&mut slot.entity)
    }

    fn live(&self) -> impl Iterator<Item = (EntityKey, &E)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (EntityKey(i), &s.entity)))
    }

    fn insert(&mut self, entity: E, dirty: bool) -> EntityKey {
        let key = EntityKey(self.slots.len());
        if let Some(id) = entity.id() {
            self.by_id.insert(id, key);
        }
        self.slots.push(Some(Slot { entity, dirty }));
        key
    }

    fn take(&mut self, key: EntityKey) -> Option<E> {
        let slot = self.slots.get_mut(key.0)?.take()?;
        if let Some(id) = slot.entity.id() {
            self.by_id.remove(&id);
        }
        Some(slot.entity)
    }

    /// Fetch whatever part of `range` lies outside the watermark.
    fn prefetch(&mut self, range: DateRange) -> Result<(), StoreError> {
        let fetch = match self.watermark {
            None => range,
            Some(wm) if wm.contains_range(&range) => return Ok(()),
            Some(wm) => DateRange::new(wm.end.min(range.start), wm.start.max(range.end)),
        };
        let fetched = self.repo.get_by_date(&self.partition, fetch)?;
        self.fetches += 1;
        for entity in fetched {
            if let Some(id) = entity.id() {
                if self.by_id.contains_key(&id) || self.removed.contains(&id) {
                    continue;
                }
            }
            self.insert(entity, false);
        }
        self.watermark = Some(match self.watermark {
            Some(wm) => wm.union(&range),
            None => range,
        });
        Ok(())
    }

    /// Keys of in-memory entities overlapping `range`, fetching first if needed.
    pub fn get_by_date(&mut self, range: DateRange) -> Result<Vec<EntityKey>, StoreError> {
        self.prefetch(range)?;
        Ok(self
            .live()
            .filter(|(_, e)| e.date_range().is_some_and(|r| r.overlaps(&range)))
            .map(|(k, _)| k)
            .collect())
    }

    /// Entities overlapping `range` whose shape intersects `shape`.
    pub fn get_associated(&mut self, shape: &MultiPolygon<f64>, range: DateRange) -> Result<Vec<EntityKey>, StoreError> {
        let keys = self.get_by_date(range)?;
        let Some(query_env) = envelope(shape) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .into_iter()
            .filter(|&k| {
                self.get(k).is_some_and(|e| {
                    e.shape().bounding_rect().is_some_and(|env| env.intersects(&query_env)) && e.shape().intersects(shape)
                })
            })
            .collect())
    }

    /// Entities overlapping `range` accepted by `predicate`.
    pub fn get_matching(&mut self, range: DateRange, predicate: impl Fn(&E) -> bool) -> Result<Vec<EntityKey>, StoreError> {
        let keys = self.get_by_date(range)?;
        Ok(keys
            .into_iter()
            .filter(|&k| self.get(k).is_some_and(&predicate))
            .collect())
    }

    pub fn add(&mut self, entity: E) -> EntityKey {
        self.insert(entity, true)
    }

    pub fn add_all(&mut self, entities: impl IntoIterator<Item = E>) -> Vec<EntityKey> {
        entities.into_iter().map(|e| self.add(e)).collect()
    }

    /// Merge several entities through the repository. The inputs leave the set and the merged
    /// entity takes their place. Persisted inputs are deleted at save time.
    pub fn merge(&mut self, keys: &[EntityKey]) -> Result<EntityKey, StoreError> {
        let inputs: Vec<E> = keys.iter().filter_map(|&k| self.get(k).cloned()).collect();
        let merged = self.repo.merge(inputs)?;
        for &key in keys {
            self.remove(key);
        }
        Ok(self.add(merged))
    }

    /// Drop an entity. A persisted entity is deleted at save time.
    pub fn remove(&mut self, key: EntityKey) -> Option<E> {
        let entity = self.take(key)?;
        if let Some(id) = entity.id() {
            self.removed.push(id);
        }
        Some(entity)
    }

    /// Persist every entity without an id, write back touched entities and apply removals.
    /// Returns how many entities were newly created.
    pub fn save_new_entities(&mut self) -> Result<usize, StoreError> {
        for id in std::mem::take(&mut self.removed) {
            match self.repo.delete(id) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let mut created = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            if slot.entity.id().is_none() {
                let id = self.repo.save(&mut slot.entity)?;
                self.by_id.insert(id, EntityKey(index));
                created += 1;
            } else if slot.dirty {
                self.repo.save(&mut slot.entity)?;
            }
            slot.dirty = false;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Clump, DAY_MS, RawData};
    use crate::repository::ClumpRepository;
    use crate::store::InMemoryStore;
    use geo::{Geometry, Rect, coord};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Fires with fixed ids; records every fetched range.
    struct RecordingRepo {
        fires: Vec<Fire>,
        fetched: Mutex<Vec<DateRange>>,
        fail_next: AtomicBool,
        saved: Mutex<Vec<Ulid>>,
        deleted: Mutex<Vec<Ulid>>,
    }

    impl RecordingRepo {
        fn new(fires: Vec<Fire>) -> Self {
            Self {
                fires,
                fetched: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
                saved: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    impl Repository<Fire> for RecordingRepo {
        fn get_by_date(&self, source: &SourceId, range: DateRange) -> Result<Vec<Fire>, StoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Io("offline".into()));
            }
            self.fetched.lock().unwrap().push(range);
            Ok(self
                .fires
                .iter()
                .filter(|f| &f.source == source && f.range().is_some_and(|r| r.overlaps(&range)))
                .cloned()
                .collect())
        }

        fn save(&self, fire: &mut Fire) -> Result<Ulid, StoreError> {
            let id = fire.id.unwrap_or_else(Ulid::new);
            fire.set_id(id);
            self.saved.lock().unwrap().push(id);
            Ok(id)
        }

        fn delete(&self, id: Ulid) -> Result<(), StoreError> {
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }

        fn merge(&self, fires: Vec<Fire>) -> Result<Fire, StoreError> {
            let mut merged = Fire::new(fires[0].source.clone());
            for fire in fires {
                merged.absorb(fire)?;
            }
            Ok(merged)
        }
    }

    fn square(x: f64) -> geo::MultiPolygon<f64> {
        geo::MultiPolygon::new(vec![Rect::new(coord! { x: x, y: 0.0 }, coord! { x: x + 10.0, y: 10.0 }).to_polygon()])
    }

    fn fire_on(day: i64, x: f64) -> Fire {
        let source = SourceId::from("src");
        let range = DateRange::day(day * DAY_MS);
        let raw = RawData::new(source.clone(), Geometry::MultiPolygon(square(x)), 0.0, range);
        let clump = Clump::new(source.clone(), square(x), 100.0, vec![raw]).unwrap();
        let mut fire = Fire::new(source);
        fire.set_id(Ulid::new());
        fire.add_clump(clump).unwrap();
        fire
    }

    fn days(a: i64, b: i64) -> DateRange {
        DateRange::new(a * DAY_MS, (b + 1) * DAY_MS - 1)
    }

    #[test]
    fn covered_ranges_are_not_refetched() {
        let repo = RecordingRepo::new((0..10).map(|d| fire_on(d, 0.0)).collect());
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        assert_eq!(set.get_by_date(days(2, 5)).unwrap().len(), 4);
        assert_eq!(set.get_by_date(days(3, 4)).unwrap().len(), 2);
        assert_eq!(set.fetch_count(), 1);

        set.get_by_date(days(4, 7)).unwrap();
        assert_eq!(set.fetch_count(), 2);
        assert_eq!(repo.fetched.lock().unwrap()[1], DateRange::new(4 * DAY_MS, 8 * DAY_MS - 1));
        assert_eq!(set.watermark(), Some(days(2, 7)));
    }

    #[test]
    fn disjoint_range_fetches_gap_too() {
        let repo = RecordingRepo::new((0..10).map(|d| fire_on(d, 0.0)).collect());
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        set.get_by_date(days(0, 1)).unwrap();
        set.get_by_date(days(6, 7)).unwrap();
        assert_eq!(set.watermark(), Some(days(0, 7)));
        // the gap between the two requests is now covered, so no further fetch
        assert_eq!(set.get_by_date(days(3, 4)).unwrap().len(), 2);
        assert_eq!(set.fetch_count(), 2);
    }

    #[test]
    fn in_memory_set_matches_ground_truth() {
        let fires: Vec<Fire> = (0..30).map(|d| fire_on(d, 0.0)).collect();
        let repo = RecordingRepo::new(fires.clone());
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        let requests = [days(10, 12), days(11, 11), days(20, 22), days(5, 25), days(0, 2), days(1, 1)];
        for r in requests {
            set.get_by_date(r).unwrap();
        }
        // fetches for 10-12, 20-22, 5-25 and 0-2; 11-11 and 1-1 are already covered
        assert_eq!(set.fetch_count(), 4);
        let mut held: Vec<Ulid> = set.keys().iter().filter_map(|&k| set.get(k).and_then(|f| f.id)).collect();
        held.sort();
        let mut expected: Vec<Ulid> = fires[0..=25].iter().filter_map(|f| f.id).collect();
        expected.sort();
        assert_eq!(held, expected);
    }

    #[test]
    fn same_entity_keeps_its_key() {
        let repo = RecordingRepo::new(vec![fire_on(3, 0.0)]);
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        let first = set.get_by_date(days(3, 3)).unwrap();
        let second = set.get_by_date(days(0, 9)).unwrap();
        assert_eq!(first, second);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn failed_fetch_leaves_watermark() {
        let repo = RecordingRepo::new(vec![fire_on(3, 0.0)]);
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        repo.fail_next.store(true, Ordering::SeqCst);
        assert!(set.get_by_date(days(0, 5)).is_err());
        assert_eq!(set.watermark(), None);
        assert_eq!(set.get_by_date(days(0, 5)).unwrap().len(), 1);
    }

    #[test]
    fn associated_filters_by_shape() {
        let repo = RecordingRepo::new(vec![fire_on(1, 0.0), fire_on(1, 500.0)]);
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        let hits = set.get_associated(&square(5.0), days(0, 2)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(set.get(hits[0]).unwrap().shape, square(0.0));
    }

    #[test]
    fn matching_uses_predicate() {
        let mut named = fire_on(1, 0.0);
        named.attributes.insert("IrwinID".into(), "abc".into());
        let repo = RecordingRepo::new(vec![named, fire_on(1, 50.0)]);
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        let hits = set
            .get_matching(days(0, 2), |f| f.attributes.get("IrwinID").is_some_and(|v| v == "abc"))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn merge_replaces_inputs() {
        let repo = RecordingRepo::new(vec![fire_on(1, 0.0), fire_on(2, 5.0)]);
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        let keys = set.get_by_date(days(0, 3)).unwrap();
        let inputs: Vec<Ulid> = keys.iter().filter_map(|&k| set.get(k).and_then(|f| f.id)).collect();
        let merged = set.merge(&keys).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(merged).unwrap().clumps().len(), 2);
        assert!(repo.deleted.lock().unwrap().is_empty());

        assert_eq!(set.save_new_entities().unwrap(), 1);
        assert!(set.get(merged).unwrap().id.is_some());
        assert_eq!(*repo.deleted.lock().unwrap(), inputs);
    }

    #[test]
    fn unsaved_merge_leaves_store_intact() {
        let store = InMemoryStore::new();
        let src = SourceId::from("src");
        let mut stored = Vec::new();
        for (day, x) in [(1, 0.0), (2, 5.0)] {
            let mut fire = fire_on(day, x);
            ClumpRepository::save(&store, &fire.clumps()[0]).unwrap();
            Repository::<Fire>::save(&store, &mut fire).unwrap();
            stored.push(fire);
        }
        let clump = stored[0].clumps()[0].id;

        {
            let mut set: QueryableSet<'_, Fire, InMemoryStore> = QueryableSet::new(&store, src.clone());
            let keys = set.get_by_date(days(0, 3)).unwrap();
            set.merge(&keys).unwrap();
        }
        assert_eq!(store.fires_of(&src).len(), 2);
        assert_eq!(store.clump(&clump).unwrap().fire, stored[0].id);

        let mut set: QueryableSet<'_, Fire, InMemoryStore> = QueryableSet::new(&store, src.clone());
        let keys = set.get_by_date(days(0, 3)).unwrap();
        let merged = set.merge(&keys).unwrap();
        assert_eq!(set.save_new_entities().unwrap(), 1);
        let fires = store.fires_of(&src);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].id, set.get(merged).unwrap().id);
        assert_eq!(store.clump(&clump).unwrap().fire, fires[0].id);
    }

    #[test]
    fn save_writes_new_dirty_and_removed() {
        let repo = RecordingRepo::new(vec![fire_on(1, 0.0), fire_on(1, 100.0)]);
        let mut set = QueryableSet::new(&repo, SourceId::from("src"));
        let keys = set.get_by_date(days(0, 3)).unwrap();
        let gone = set.remove(keys[0]).unwrap().id.unwrap();
        set.get_mut(keys[1]).unwrap().area = 42.0;
        set.add(fire_on(2, 300.0));
        let mut fresh = Fire::new(SourceId::from("src"));
        fresh.add_clump(fire_on(2, 600.0).clumps()[0].clone()).unwrap();
        set.add(fresh);

        // `add` marks entities for write-back even when they already carry an id
        assert_eq!(set.save_new_entities().unwrap(), 1);
        assert_eq!(*repo.deleted.lock().unwrap(), vec![gone]);
        assert_eq!(repo.saved.lock().unwrap().len(), 3);
        assert_eq!(set.save_new_entities().unwrap(), 0);
        assert_eq!(repo.saved.lock().unwrap().len(), 3);
    }
}
