use std::collections::BTreeMap;

use geo::MultiPolygon;
use tracing::{debug, info};

use super::{Attached, MethodError, Reconciliation, ReconciliationMethod, SkipReason};
use crate::geometry::{GeometryError, buffer_shape, union_all};
use crate::limits::MULTIPOLYGON_BUFFER_PART_LIMIT;
use crate::model::{
    Attributes, DateRange, Event, EventDay, EventSlice, Fire, Ms, ReconciliationStream, SourceId, UNKNOWN_FIRE_NAME,
    UNKNOWN_FIRE_TYPE, WILDFIRE, Weighting,
};
use crate::queryable::EventSet;

pub const SHAPE_SOURCE: &str = "shape";
pub const NAME_SOURCE: &str = "name";
pub const START_DATE_SOURCE: &str = "start_date";
pub const END_DATE_SOURCE: &str = "end_date";
pub const SIZE_SOURCE: &str = "size";
pub const TYPE_SOURCE: &str = "type";
pub const GROWTH_SOURCE: &str = "growth";

const METERS_PER_KILOMETER: f64 = 1000.0;

/// Weighted reconciliation: each event field comes from the source the stream trusts most for
/// that field.
pub struct DefaultReconciliation {
    stream: ReconciliationStream,
}

impl DefaultReconciliation {
    pub fn new(stream: &ReconciliationStream) -> Self {
        Self { stream: stream.clone() }
    }
}

impl ReconciliationMethod for DefaultReconciliation {
    fn reconcile(&self, fire: &Fire, events: &mut EventSet<'_>) -> Result<Reconciliation, MethodError> {
        let Some(weighting) = self.stream.weighting(&fire.source) else {
            return Ok(Err(SkipReason::NoWeighting(fire.source.clone())));
        };
        let Some(range) = fire.range() else {
            return Ok(Err(SkipReason::EmptyFire));
        };

        // uncertainty is a diameter in kilometres
        let distance = weighting.location_uncertainty * METERS_PER_KILOMETER / 2.0;
        let parts = fire.shape.0.len();
        let query = if parts > MULTIPOLYGON_BUFFER_PART_LIMIT {
            info!("fire shape has {parts} polygons; querying events with the unbuffered shape");
            fire.shape.clone()
        } else {
            buffer_shape(&fire.shape, distance)?
        };
        let window = range.widen(weighting.start_date_uncertainty, weighting.end_date_uncertainty);

        let candidates = events.get_associated(&query, window)?;
        let attached = match candidates.as_slice() {
            [] => Attached {
                key: events.add(Event::new(self.stream.id.clone())),
                created: true,
            },
            [only] => Attached {
                key: *only,
                created: false,
            },
            _ => Attached {
                key: events.merge(&candidates)?,
                created: false,
            },
        };
        let event = events
            .get_mut(attached.key)
            .ok_or_else(|| MethodError::InvalidData(format!("event {:?} left the set", attached.key)))?;
        event.add_fire(fire.clone());
        populate(event, &self.stream)?;
        debug!("fire {:?} reconciled into event {:?}", fire.id, event.id);
        Ok(Ok(attached))
    }
}

/// Recompute every derived field of `event` from its fires.
pub fn populate(event: &mut Event, stream: &ReconciliationStream) -> Result<(), GeometryError> {
    let slices = event.slices(stream);
    if slices.is_empty() {
        return Ok(());
    }
    let mut sources = BTreeMap::new();

    let shape_slice = top(&slices, |w| w.shape_weight);
    sources.insert(SHAPE_SOURCE.to_string(), shape_slice.source.clone());
    let shapes: Vec<MultiPolygon<f64>> = shape_slice.fires.iter().map(|f| f.shape.clone()).collect();
    let shape = union_all(&shapes)?;

    let attributes = merged_attributes(&slices);
    let display_name = display_name(&slices, &attributes, &mut sources);

    let start_slice = least(&slices, |w| w.start_date_uncertainty);
    sources.insert(START_DATE_SOURCE.to_string(), start_slice.source.clone());
    let start = slices
        .iter()
        .flat_map(|s| s.fires.iter())
        .filter_map(|f| f.range())
        .map(|r| r.start)
        .min();
    let end_slice = least(&slices, |w| w.end_date_uncertainty);
    sources.insert(END_DATE_SOURCE.to_string(), end_slice.source.clone());
    let end = end_slice.fires.iter().filter_map(|f| f.range()).map(|r| r.end).max();
    let range = match (start, end) {
        (Some(start), Some(end)) => Some(DateRange::new(start, end.max(start))),
        _ => None,
    };

    let size_slice = top(&slices, |w| w.size_weight);
    sources.insert(SIZE_SOURCE.to_string(), size_slice.source.clone());
    let total_area: f64 = size_slice.fires.iter().map(|f| f.area).sum();

    let probability = 1.0 - event.fires().iter().map(|f| 1.0 - f.probability).product::<f64>();

    let type_slice = top(&slices, |w| w.type_weight);
    sources.insert(TYPE_SOURCE.to_string(), type_slice.source.clone());
    let fire_type = dominant_type(type_slice);

    let growth_slice = top(&slices, |w| w.growth_weight);
    sources.insert(GROWTH_SOURCE.to_string(), growth_slice.source.clone());
    let event_days = event_days(growth_slice, total_area)?;

    event.shape = shape;
    event.attributes = attributes;
    event.display_name = display_name;
    event.range = range;
    event.total_area = total_area;
    event.probability = probability;
    event.fire_type = fire_type;
    event.event_days = event_days;
    event.weighting_sources = sources;
    Ok(())
}

/// First slice with the highest weight.
fn top<'s, 'a>(slices: &'s [EventSlice<'a>], weight: impl Fn(&Weighting) -> f64) -> &'s EventSlice<'a> {
    let mut best = &slices[0];
    for slice in &slices[1..] {
        if weight(&slice.weighting) > weight(&best.weighting) {
            best = slice;
        }
    }
    best
}

/// First slice with the lowest uncertainty.
fn least<'s, 'a>(slices: &'s [EventSlice<'a>], uncertainty: impl Fn(&Weighting) -> i64) -> &'s EventSlice<'a> {
    let mut best = &slices[0];
    for slice in &slices[1..] {
        if uncertainty(&slice.weighting) < uncertainty(&best.weighting) {
            best = slice;
        }
    }
    best
}

fn by_name_weight<'s, 'a>(slices: &'s [EventSlice<'a>]) -> Vec<&'s EventSlice<'a>> {
    let mut sorted: Vec<&EventSlice> = slices.iter().collect();
    sorted.sort_by(|a, b| a.weighting.name_weight.total_cmp(&b.weighting.name_weight));
    sorted
}

/// Slices by ascending name weight, each slice's fires by ascending area; later values win.
fn merged_attributes(slices: &[EventSlice<'_>]) -> Attributes {
    let mut attributes = Attributes::new();
    for slice in by_name_weight(slices) {
        let mut fires = slice.fires.clone();
        fires.sort_by(|a, b| a.area.total_cmp(&b.area));
        for fire in fires {
            attributes.extend(fire.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    attributes
}

/// The latest-ending fire's name from the most name-trusted slice that knows one.
fn display_name(slices: &[EventSlice<'_>], attributes: &Attributes, sources: &mut BTreeMap<String, SourceId>) -> String {
    let mut ranked: Vec<&EventSlice> = slices.iter().collect();
    ranked.sort_by(|a, b| b.weighting.name_weight.total_cmp(&a.weighting.name_weight));
    for slice in ranked {
        let mut latest: Option<(Ms, &str)> = None;
        for fire in &slice.fires {
            let end = fire.range().map_or(Ms::MIN, |r| r.end);
            if latest.is_none_or(|(best, _)| end > best) {
                latest = Some((end, fire.display_name.as_str()));
            }
        }
        if let Some((_, name)) = latest.filter(|(_, name)| *name != UNKNOWN_FIRE_NAME) {
            sources.insert(NAME_SOURCE.to_string(), slice.source.clone());
            return name.to_string();
        }
    }
    match location(attributes) {
        Some(location) => format!("Unnamed fire in {location}"),
        None => UNKNOWN_FIRE_NAME.to_string(),
    }
}

/// "Kern County, Ca" style location from country, state and county attributes.
fn location(attributes: &Attributes) -> Option<String> {
    let Some(country) = attributes.get("CNTRY") else {
        return attributes.get("location").cloned();
    };
    let county = attributes.get("CNTY").map_or("null", String::as_str);
    let state = attributes.get("STATE").map_or("null", String::as_str);
    let text = match country.as_str() {
        "USA" => format!("{county} County, {state}"),
        "CANADA" | "MEXICO" => format!("{county}, {state}, {country}"),
        _ => country.clone(),
    };
    Some(capitalize_words(&text))
}

fn capitalize_words(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// A wildfire anywhere in the slice makes the event a wildfire; otherwise the last fire's type.
fn dominant_type(slice: &EventSlice<'_>) -> String {
    let mut fire_type = UNKNOWN_FIRE_TYPE;
    for fire in &slice.fires {
        if fire.fire_type == WILDFIRE {
            return WILDFIRE.to_string();
        }
        fire_type = fire.fire_type.as_str();
    }
    fire_type.to_string()
}

/// The slice's fire days summed per date and scaled so they add up to `total_area`.
fn event_days(slice: &EventSlice<'_>, total_area: f64) -> Result<Vec<EventDay>, GeometryError> {
    let mut per_day: BTreeMap<Ms, f64> = BTreeMap::new();
    for fire in &slice.fires {
        for day in fire.fire_days()? {
            *per_day.entry(day.date).or_default() += day.area;
        }
    }
    let sum: f64 = per_day.values().sum();
    let scale = if sum > 0.0 { total_area / sum } else { 0.0 };
    Ok(per_day
        .into_iter()
        .map(|(date, area)| EventDay {
            date,
            area: area * scale,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Clump, DAY_MS, RawData, StreamId};
    use crate::repository::EventRepository;
    use crate::store::InMemoryStore;
    use geo::{Geometry, Rect, coord};
    use ulid::Ulid;

    fn square(x: f64, side: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![Rect::new(coord! { x: x, y: 0.0 }, coord! { x: x + side, y: side }).to_polygon()])
    }

    struct FireSpec<'a> {
        source: &'a str,
        x: f64,
        days: (i64, i64),
        area: f64,
        probability: f64,
        fire_type: &'a str,
        name: &'a str,
    }

    impl Default for FireSpec<'_> {
        fn default() -> Self {
            Self {
                source: "a",
                x: 0.0,
                days: (0, 0),
                area: 100.0,
                probability: 0.5,
                fire_type: WILDFIRE,
                name: UNKNOWN_FIRE_NAME,
            }
        }
    }

    fn fire(spec: FireSpec<'_>) -> Fire {
        let source = SourceId::from(spec.source);
        let mut fire = Fire::new(source.clone());
        for day in spec.days.0..=spec.days.1 {
            let range = DateRange::day(day * DAY_MS);
            let raw = RawData::new(source.clone(), Geometry::MultiPolygon(square(spec.x, 10.0)), 0.0, range);
            fire.add_clump(Clump::new(source.clone(), square(spec.x, 10.0), 1.0, vec![raw]).unwrap())
                .unwrap();
        }
        fire.set_id(Ulid::new());
        fire.area = spec.area;
        fire.probability = spec.probability;
        fire.fire_type = spec.fire_type.to_string();
        fire.display_name = spec.name.to_string();
        fire
    }

    fn stream(weights: &[(&str, Weighting)]) -> ReconciliationStream {
        let mut stream = ReconciliationStream::new("s", "Stream");
        for (source, weighting) in weights {
            stream = stream.with_source(&SourceId::from(*source), *weighting);
        }
        stream
    }

    fn weighting(f: impl FnOnce(&mut Weighting)) -> Weighting {
        let mut w = Weighting::default();
        f(&mut w);
        w
    }

    #[test]
    fn overlapping_fires_share_an_event() {
        let stream = stream(&[
            ("a", weighting(|w| w.end_date_uncertainty = 1)),
            ("b", weighting(|w| w.size_weight = 2.0)),
        ]);
        let store = InMemoryStore::new();
        let repo: &dyn EventRepository = &store;
        let mut events = EventSet::new(repo, StreamId::from("s"));
        let method = DefaultReconciliation::new(&stream);

        let first = fire(FireSpec {
            probability: 0.9,
            ..Default::default()
        });
        let second = fire(FireSpec {
            source: "b",
            x: 5.0,
            days: (0, 1),
            area: 70.0,
            probability: 0.8,
            ..Default::default()
        });
        let a = method.reconcile(&first, &mut events).unwrap().unwrap();
        assert!(a.created);
        let b = method.reconcile(&second, &mut events).unwrap().unwrap();
        assert_eq!(a.key, b.key);
        assert!(!b.created);

        let event = events.get(a.key).unwrap();
        assert_eq!(event.fires().len(), 2);
        assert!((event.probability - 0.98).abs() < 1e-9);
        assert_eq!(event.total_area, 70.0);
        assert_eq!(event.weighting_sources[SIZE_SOURCE], SourceId::from("b"));
        assert_eq!(event.weighting_sources[END_DATE_SOURCE], SourceId::from("b"));
        assert_eq!(event.range, Some(DateRange::new(0, 2 * DAY_MS - 1)));
    }

    #[test]
    fn unweighted_source_is_skipped() {
        let stream = stream(&[("a", Weighting::default())]);
        let store = InMemoryStore::new();
        let repo: &dyn EventRepository = &store;
        let mut events = EventSet::new(repo, StreamId::from("s"));
        let outcome = DefaultReconciliation::new(&stream)
            .reconcile(&fire(FireSpec {
                source: "z",
                ..Default::default()
            }), &mut events)
            .unwrap();
        assert_eq!(outcome, Err(SkipReason::NoWeighting(SourceId::from("z"))));
        assert!(events.is_empty());
    }

    #[test]
    fn date_uncertainty_widens_window() {
        let strict = stream(&[("a", Weighting::default())]);
        let loose = stream(&[("a", weighting(|w| w.start_date_uncertainty = 3))]);
        for (stream, expected_events) in [(strict, 2), (loose, 1)] {
            let store = InMemoryStore::new();
            let repo: &dyn EventRepository = &store;
            let mut events = EventSet::new(repo, StreamId::from("s"));
            let method = DefaultReconciliation::new(&stream);
            method.reconcile(&fire(FireSpec::default()), &mut events).unwrap().unwrap();
            method
                .reconcile(&fire(FireSpec {
                    days: (3, 3),
                    ..Default::default()
                }), &mut events)
                .unwrap()
                .unwrap();
            assert_eq!(events.len(), expected_events);
        }
    }

    #[test]
    fn bridging_fire_merges_events() {
        let stream = stream(&[("a", weighting(|w| w.location_uncertainty = 0.012))]);
        let store = InMemoryStore::new();
        let repo: &dyn EventRepository = &store;
        let mut events = EventSet::new(repo, StreamId::from("s"));
        let method = DefaultReconciliation::new(&stream);
        method.reconcile(&fire(FireSpec::default()), &mut events).unwrap().unwrap();
        method
            .reconcile(&fire(FireSpec {
                x: 30.0,
                ..Default::default()
            }), &mut events)
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 2);

        // a 6 m buffer spans the 5 m gaps on either side of the middle fire
        let bridge = method
            .reconcile(&fire(FireSpec {
                x: 15.0,
                area: 10.0,
                ..Default::default()
            }), &mut events)
            .unwrap()
            .unwrap();
        assert!(!bridge.created);
        assert_eq!(events.len(), 1);
        assert_eq!(events.get(bridge.key).unwrap().fires().len(), 3);
    }

    #[test]
    fn name_from_most_trusted_known_name() {
        let stream = stream(&[
            ("a", weighting(|w| w.name_weight = 2.0)),
            ("b", weighting(|w| w.name_weight = 1.0)),
        ]);
        let mut event = Event::new(stream.id.clone());
        event.add_fire(fire(FireSpec::default()));
        event.add_fire(fire(FireSpec {
            source: "b",
            name: "Old Name Fire",
            ..Default::default()
        }));
        event.add_fire(fire(FireSpec {
            source: "b",
            days: (1, 1),
            name: "Bear Fire",
            ..Default::default()
        }));
        populate(&mut event, &stream).unwrap();
        assert_eq!(event.display_name, "Bear Fire");
        assert_eq!(event.weighting_sources[NAME_SOURCE], SourceId::from("b"));
    }

    #[test]
    fn unnamed_event_uses_location() {
        let stream = stream(&[("a", Weighting::default())]);
        let mut event = Event::new(stream.id.clone());
        let mut located = fire(FireSpec::default());
        located.attributes.insert("CNTRY".into(), "USA".into());
        located.attributes.insert("CNTY".into(), "KERN".into());
        located.attributes.insert("STATE".into(), "CA".into());
        event.add_fire(located);
        populate(&mut event, &stream).unwrap();
        assert_eq!(event.display_name, "Unnamed fire in Kern County, Ca");

        let mut bare = Event::new(stream.id.clone());
        bare.add_fire(fire(FireSpec::default()));
        populate(&mut bare, &stream).unwrap();
        assert_eq!(bare.display_name, UNKNOWN_FIRE_NAME);
    }

    #[test]
    fn wildfire_type_dominates() {
        let stream = stream(&[("a", Weighting::default())]);
        let mut event = Event::new(stream.id.clone());
        event.add_fire(fire(FireSpec {
            fire_type: "RX",
            ..Default::default()
        }));
        event.add_fire(fire(FireSpec::default()));
        event.add_fire(fire(FireSpec {
            fire_type: "RX",
            ..Default::default()
        }));
        populate(&mut event, &stream).unwrap();
        assert_eq!(event.fire_type, WILDFIRE);
    }

    #[test]
    fn event_days_scale_to_total_area() {
        let stream = stream(&[("a", Weighting::default())]);
        let mut event = Event::new(stream.id.clone());
        event.add_fire(fire(FireSpec {
            days: (0, 1),
            area: 1000.0,
            ..Default::default()
        }));
        populate(&mut event, &stream).unwrap();
        assert_eq!(event.event_days.len(), 2);
        assert!((event.event_days[0].area - 500.0).abs() < 1e-6);
        let total: f64 = event.event_days.iter().map(|d| d.area).sum();
        assert!((total - 1000.0).abs() < 1e-6);
        assert!((crate::geometry::area(&event.shape) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn attributes_follow_name_weight_then_size() {
        let stream = stream(&[
            ("a", weighting(|w| w.name_weight = 2.0)),
            ("b", weighting(|w| w.name_weight = 1.0)),
        ]);
        let mut event = Event::new(stream.id.clone());
        let mut big = fire(FireSpec {
            area: 900.0,
            ..Default::default()
        });
        big.attributes.insert("k".into(), "a-big".into());
        let mut small = fire(FireSpec {
            area: 1.0,
            ..Default::default()
        });
        small.attributes.insert("k".into(), "a-small".into());
        let mut other = fire(FireSpec {
            source: "b",
            ..Default::default()
        });
        other.attributes.insert("k".into(), "b".into());
        other.attributes.insert("only_b".into(), "yes".into());
        event.add_fire(big);
        event.add_fire(small);
        event.add_fire(other);
        populate(&mut event, &stream).unwrap();
        assert_eq!(event.attributes["k"], "a-big");
        assert_eq!(event.attributes["only_b"], "yes");
    }
}
