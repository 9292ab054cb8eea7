//! Persistence contracts. Jobs only ever see these traits; `store::InMemoryStore` is the
//! implementation the binary and the tests wire in.

use std::collections::BTreeSet;
use std::sync::Arc;

use ulid::Ulid;

use crate::geometry::GeometryError;
use crate::model::*;
use crate::queryable::Entity;
use crate::store::InMemoryStore;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound(Ulid),
    UnknownSource(SourceId),
    UnknownStream(StreamId),
    UnknownFetch(String),
    /// Merge inputs span more than one source or stream.
    MixedPartitions,
    Geometry(GeometryError),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::UnknownSource(id) => write!(f, "unknown source: {id}"),
            StoreError::UnknownStream(id) => write!(f, "unknown stream: {id}"),
            StoreError::UnknownFetch(name) => write!(f, "unknown scheduled fetch: {name}"),
            StoreError::MixedPartitions => write!(f, "cannot merge entities from different partitions"),
            StoreError::Geometry(e) => write!(f, "geometry error: {e}"),
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<GeometryError> for StoreError {
    fn from(e: GeometryError) -> Self {
        StoreError::Geometry(e)
    }
}

/// Range-fetchable storage for one entity kind, partitioned by source or stream.
pub trait Repository<E: Entity>: Send + Sync {
    /// Every stored entity of `partition` whose date range overlaps `range`.
    fn get_by_date(&self, partition: &E::Partition, range: DateRange) -> Result<Vec<E>, StoreError>;

    /// Persist `entity`, assigning its id if it has none. Returns the id.
    fn save(&self, entity: &mut E) -> Result<Ulid, StoreError>;

    fn delete(&self, id: Ulid) -> Result<(), StoreError>;

    /// Combine `entities` into one unsaved entity. Stored inputs are left alone.
    fn merge(&self, entities: Vec<E>) -> Result<E, StoreError>;
}

pub trait FireRepository: Repository<Fire> {
    /// Delete fires of `source` that have no clumps left. Returns how many went.
    fn delete_orphaned(&self, source: &SourceId) -> Result<usize, StoreError>;
}

pub trait EventRepository: Repository<Event> {}

pub trait RawDataRepository: Send + Sync {
    fn get_by_date(&self, source: &SourceId, range: DateRange) -> Result<Vec<RawData>, StoreError>;
    fn save_all(&self, records: &[RawData]) -> Result<usize, StoreError>;
    fn delete_by_date(&self, source: &SourceId, range: DateRange) -> Result<usize, StoreError>;
    /// Delete records in range whose `attribute` value is one of `values`.
    fn delete_by_date_and_attribute(
        &self,
        source: &SourceId,
        range: DateRange,
        attribute: &str,
        values: &BTreeSet<String>,
    ) -> Result<usize, StoreError>;
}

pub trait ClumpRepository: Send + Sync {
    fn get_by_date(&self, source: &SourceId, range: DateRange) -> Result<Vec<Clump>, StoreError>;
    /// Clumps in range not yet attached to a fire.
    fn get_unassociated(&self, source: &SourceId, range: DateRange) -> Result<Vec<Clump>, StoreError>;
    /// Persist a clump and link its raw data to it.
    fn save(&self, clump: &Clump) -> Result<(), StoreError>;
}

/// Sources, streams and scheduled fetches.
pub trait Catalog: Send + Sync {
    fn source(&self, id: &SourceId) -> Result<Source, StoreError>;
    fn sources(&self) -> Result<Vec<Source>, StoreError>;
    fn stream(&self, id: &StreamId) -> Result<ReconciliationStream, StoreError>;
    fn streams(&self) -> Result<Vec<ReconciliationStream>, StoreError>;
    fn scheduled_fetch(&self, name: &str) -> Result<ScheduledFetch, StoreError>;
    fn set_latest_data(&self, id: &SourceId, latest: Ms) -> Result<(), StoreError>;
}

/// Every repository a job may need, passed by value into `job::Services`.
#[derive(Clone)]
pub struct Repositories {
    pub raw_data: Arc<dyn RawDataRepository>,
    pub clumps: Arc<dyn ClumpRepository>,
    pub fires: Arc<dyn FireRepository>,
    pub events: Arc<dyn EventRepository>,
    pub catalog: Arc<dyn Catalog>,
}

impl Repositories {
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            raw_data: store.clone(),
            clumps: store.clone(),
            fires: store.clone(),
            events: store.clone(),
            catalog: store,
        }
    }
}
