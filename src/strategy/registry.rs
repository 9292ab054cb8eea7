use std::collections::BTreeMap;

use super::acquire::{FetchMethod, FileDropConfig, FileDropFetch, IngestMethod, JsonLinesIngest};
use super::assoc::{
    CwfisAreaConfig, DailyArea, DailyAreaConfig, Facts, FieldListConfig, GeoMac, GroundReport, GroundReportConfig, Ics209,
    Irwin, PredicateSpatial, SingleFieldConfig, Window,
};
use super::clump::{CwfisClump, CwfisConfig, DefaultClump, PerRecordClump, RadiusConfig, ReportedAreaClump};
use super::firetype::{CrosswalkConfig, FetsConfig, FixedFireType, FixedTypeConfig, TypeFieldConfig, VotedFireType};
use super::probability::DefaultProbability;
use super::reconcile::DefaultReconciliation;
use super::{
    AssociationMethod, AttributeReader, ClumpMethod, ConfigError, ConfigField, FireTypeMethod, MethodConfig, NoConfig,
    ProbabilityMethod, ReconciliationMethod,
};
use crate::model::{Attributes, ReconciliationStream, ScheduledFetch, Source};

/// Catalog entries that carry a method attribute bag.
pub trait Configurable {
    fn attributes(&self) -> &Attributes;
}

impl Configurable for Source {
    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

impl Configurable for ReconciliationStream {
    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

impl Configurable for ScheduledFetch {
    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

type Factory<S, M> = Box<dyn Fn(&S, &AttributeReader<'_>) -> Result<Box<M>, ConfigError> + Send + Sync>;

struct Entry<S, M: ?Sized> {
    fields: &'static [ConfigField],
    build: Factory<S, M>,
}

/// Named factories for one kind of method, built from a catalog entry `S`.
pub struct Table<S, M: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Entry<S, M>>,
}

impl<S: Configurable, M: ?Sized> Table<S, M> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Register `build` under `name`. Its config is parsed from the entry's attributes each time
    /// the method is built.
    pub fn register<C: MethodConfig + 'static>(
        &mut self,
        name: &str,
        build: impl Fn(&S, C) -> Box<M> + Send + Sync + 'static,
    ) {
        let factory: Factory<S, M> = Box::new(move |subject, attrs| Ok(build(subject, C::from_attributes(attrs)?)));
        self.entries.insert(
            name.to_string(),
            Entry {
                fields: C::FIELDS,
                build: factory,
            },
        );
    }

    pub fn build(&self, name: &str, subject: &S) -> Result<Box<M>, ConfigError> {
        let entry = self.entries.get(name).ok_or_else(|| ConfigError::UnknownMethod {
            kind: self.kind,
            name: name.to_string(),
        })?;
        (entry.build)(subject, &AttributeReader::new(name, subject.attributes()))
    }

    /// Attributes the named method reads, `None` for an unknown name.
    pub fn fields(&self, name: &str) -> Option<&'static [ConfigField]> {
        self.entries.get(name).map(|e| e.fields)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Every pluggable method, by kind and name. Built once at start-up and shared by all jobs.
pub struct MethodRegistry {
    pub clump: Table<Source, dyn ClumpMethod>,
    pub association: Table<Source, dyn AssociationMethod>,
    pub probability: Table<Source, dyn ProbabilityMethod>,
    pub fire_type: Table<Source, dyn FireTypeMethod>,
    pub ingest: Table<Source, dyn IngestMethod>,
    pub reconciliation: Table<ReconciliationStream, dyn ReconciliationMethod>,
    pub fetch: Table<ScheduledFetch, dyn FetchMethod>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MethodRegistry {
    pub fn empty() -> Self {
        Self {
            clump: Table::new("clump"),
            association: Table::new("association"),
            probability: Table::new("probability"),
            fire_type: Table::new("fire type"),
            ingest: Table::new("ingest"),
            reconciliation: Table::new("reconciliation"),
            fetch: Table::new("fetch"),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        let clump = &mut registry.clump;
        clump.register("default", |s: &Source, c: RadiusConfig| Box::new(DefaultClump::new(s.id.clone(), c)));
        clump.register("cwfis", |s: &Source, c: CwfisConfig| Box::new(CwfisClump::new(s.id.clone(), c)));
        clump.register("geomac", |s: &Source, _: NoConfig| Box::new(PerRecordClump::geomac(s.id.clone())));
        clump.register("mtbs_dnbr", |s: &Source, _: NoConfig| Box::new(PerRecordClump::mtbs_dnbr(s.id.clone())));
        clump.register("simple_data", |s: &Source, _: NoConfig| {
            Box::new(ReportedAreaClump::simple_data(s.id.clone()))
        });
        clump.register("cwfis_ground_report", |s: &Source, _: NoConfig| {
            Box::new(ReportedAreaClump::cwfis_ground_report(s.id.clone()))
        });

        let assoc = &mut registry.association;
        assoc.register("default", |_: &Source, c: DailyAreaConfig| Box::new(DailyArea::new(c)));
        assoc.register("daily_area", |_: &Source, c: DailyAreaConfig| Box::new(DailyArea::new(c)));
        assoc.register("cwfis", |_: &Source, c: CwfisAreaConfig| Box::new(DailyArea::cwfis(c)));
        assoc.register("geomac", |_: &Source, c: Window| Box::new(GeoMac::new(c)));
        assoc.register("ics209", |_: &Source, c: SingleFieldConfig| Box::new(Ics209::new(c)));
        assoc.register("mtbs", |_: &Source, c: SingleFieldConfig| Box::new(PredicateSpatial::mtbs(c)));
        assoc.register("geomac_shapefile", |_: &Source, c: FieldListConfig| {
            Box::new(PredicateSpatial::geomac_shapefile(c))
        });
        assoc.register("irwin", |_: &Source, _: NoConfig| Box::new(Irwin));
        assoc.register("facts", |_: &Source, _: NoConfig| Box::new(Facts));
        assoc.register("cwfis_ground_report", |_: &Source, c: GroundReportConfig| Box::new(GroundReport::new(c)));

        registry
            .probability
            .register("default", |s: &Source, _: NoConfig| Box::new(DefaultProbability::new(s)));

        let fire_type = &mut registry.fire_type;
        fire_type.register("default", |_: &Source, c: FixedTypeConfig| Box::new(FixedFireType::new(c)));
        fire_type.register("get_field", |_: &Source, c: TypeFieldConfig| Box::new(VotedFireType::get_field(c)));
        fire_type.register("fets", |_: &Source, c: FetsConfig| Box::new(VotedFireType::fets(c)));
        fire_type.register("field_crosswalk", |_: &Source, c: CrosswalkConfig| {
            Box::new(VotedFireType::field_crosswalk(c))
        });
        fire_type.register("parse_mtbs", |_: &Source, c: TypeFieldConfig| Box::new(VotedFireType::parse_mtbs(c)));

        registry
            .ingest
            .register("json_lines", |_: &Source, _: NoConfig| Box::new(JsonLinesIngest));
        registry.reconciliation.register("default", |s: &ReconciliationStream, _: NoConfig| {
            Box::new(DefaultReconciliation::new(s))
        });
        registry
            .fetch
            .register("file_drop", |_: &ScheduledFetch, c: FileDropConfig| Box::new(FileDropFetch::new(c)));

        registry
    }

    pub fn clump_method(&self, source: &Source) -> Result<Box<dyn ClumpMethod>, ConfigError> {
        self.clump.build(&source.clump_method, source)
    }

    pub fn association_method(&self, source: &Source) -> Result<Box<dyn AssociationMethod>, ConfigError> {
        self.association.build(&source.assoc_method, source)
    }

    pub fn probability_method(&self, source: &Source) -> Result<Box<dyn ProbabilityMethod>, ConfigError> {
        self.probability.build(&source.probability_method, source)
    }

    pub fn fire_type_method(&self, source: &Source) -> Result<Box<dyn FireTypeMethod>, ConfigError> {
        self.fire_type.build(&source.fire_type_method, source)
    }

    pub fn ingest_method(&self, source: &Source) -> Result<Box<dyn IngestMethod>, ConfigError> {
        self.ingest.build(&source.ingest_method, source)
    }

    pub fn reconciliation_method(
        &self,
        stream: &ReconciliationStream,
    ) -> Result<Box<dyn ReconciliationMethod>, ConfigError> {
        self.reconciliation.build(&stream.reconciliation_method, stream)
    }

    pub fn fetch_method(&self, fetch: &ScheduledFetch) -> Result<Box<dyn FetchMethod>, ConfigError> {
        self.fetch.build(&fetch.fetch_method, fetch)
    }

    /// Build every method a source names, surfacing configuration errors before any job runs.
    pub fn validate_source(&self, source: &Source) -> Result<(), ConfigError> {
        self.clump_method(source)?;
        self.association_method(source)?;
        self.probability_method(source)?;
        self.fire_type_method(source)?;
        self.ingest_method(source)?;
        Ok(())
    }

    pub fn validate_stream(&self, stream: &ReconciliationStream) -> Result<(), ConfigError> {
        self.reconciliation_method(stream).map(|_| ())
    }

    pub fn validate_fetch(&self, fetch: &ScheduledFetch) -> Result<(), ConfigError> {
        self.fetch_method(fetch).map(|_| ())
    }
}
