use std::time::Instant;

use geo::{BoundingRect, Intersects, MultiPolygon, Rect};
use metrics::histogram;
use tracing::info;

use super::{GeometryError, expand_envelope, union_all};
use crate::job::progress::{ProgressSink, fraction};
use crate::observability::DISSOLVE_DURATION_SECONDS;

/// One connected group of input shapes and the payloads that came with them.
#[derive(Debug, Clone)]
pub struct Dissolved<T> {
    pub shape: MultiPolygon<f64>,
    pub members: Vec<T>,
}

struct Bucket<T> {
    envelope: Rect<f64>,
    shapes: Vec<MultiPolygon<f64>>,
    members: Vec<T>,
}

impl<T> Bucket<T> {
    fn new(envelope: Rect<f64>, shape: MultiPolygon<f64>, member: T) -> Self {
        Self {
            envelope,
            shapes: vec![shape],
            members: vec![member],
        }
    }

    fn push(&mut self, envelope: Rect<f64>, shape: MultiPolygon<f64>, member: T) {
        self.envelope = expand_envelope(self.envelope, envelope);
        self.shapes.push(shape);
        self.members.push(member);
    }

    fn intersects_shape(&self, envelope: &Rect<f64>, shape: &MultiPolygon<f64>) -> bool {
        self.envelope.intersects(envelope) && self.shapes.iter().any(|s| s.intersects(shape))
    }

    fn intersects_bucket(&self, other: &Bucket<T>) -> bool {
        self.envelope.intersects(&other.envelope)
            && self.shapes.iter().any(|a| other.shapes.iter().any(|b| a.intersects(b)))
    }

    fn absorb(&mut self, other: Bucket<T>) {
        self.envelope = expand_envelope(self.envelope, other.envelope);
        self.shapes.extend(other.shapes);
        self.members.extend(other.members);
    }
}

/// Group shapes into maximal connected components and union each component.
///
/// Items are bucketed in input order against the newest bucket first, buckets that touch are
/// merged, and each bucket's shapes are unioned. Every item lands in exactly one output.
/// Progress runs 0-50 while bucketing, 50-60 while merging and 60-100 while unioning.
pub fn dissolve<T>(
    items: Vec<(MultiPolygon<f64>, T)>,
    progress: &dyn ProgressSink,
) -> Result<Vec<Dissolved<T>>, GeometryError> {
    let started = Instant::now();
    let total = items.len();
    info!("Dissolving {total} input shapes");
    progress.set_progress(0, "Grouping intersecting shapes");

    let mut buckets: Vec<Bucket<T>> = Vec::new();
    let mut reported = 0;
    for (n, (shape, member)) in items.into_iter().enumerate() {
        let envelope = shape.bounding_rect().ok_or(GeometryError::Empty)?;
        match buckets.iter_mut().rev().find(|b| b.intersects_shape(&envelope, &shape)) {
            Some(bucket) => bucket.push(envelope, shape, member),
            None => buckets.push(Bucket::new(envelope, shape, member)),
        }
        let pct = fraction(n + 1, total, 0, 50);
        if pct != reported {
            reported = pct;
            progress.set_progress(pct, "Grouping intersecting shapes");
        }
    }

    progress.set_progress(50, "Merging intersecting groups");
    let mut i = 0;
    while i < buckets.len() {
        let mut j = i + 1;
        while j < buckets.len() {
            if buckets[i].intersects_bucket(&buckets[j]) {
                let absorbed = buckets.remove(j);
                buckets[i].absorb(absorbed);
                // bucket i grew, so earlier non-matches must be re-tested
                j = i + 1;
            } else {
                j += 1;
            }
        }
        i += 1;
    }

    progress.set_progress(60, "Unioning groups");
    let count = buckets.len();
    let mut dissolved = Vec::with_capacity(count);
    for (n, bucket) in buckets.into_iter().enumerate() {
        let shape = union_all(&bucket.shapes)?;
        dissolved.push(Dissolved {
            shape,
            members: bucket.members,
        });
        progress.set_progress(fraction(n + 1, count, 60, 100), "Unioning groups");
    }

    progress.set_progress(100, "Dissolve complete");
    let elapsed = started.elapsed().as_secs_f64();
    histogram!(DISSOLVE_DURATION_SECONDS).record(elapsed);
    info!("Dissolved {total} shapes into {count} shapes in {elapsed:.3} seconds");
    Ok(dissolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::circle;
    use crate::job::progress::{NullProgress, ProgressReporter};
    use geo::{Intersects, coord};

    fn disc(x: f64, y: f64, r: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![circle(coord! { x: x, y: y }, r)])
    }

    fn labels<T: Clone + Ord>(out: &[Dissolved<T>]) -> Vec<Vec<T>> {
        let mut groups: Vec<Vec<T>> = out
            .iter()
            .map(|d| {
                let mut m = d.members.clone();
                m.sort();
                m
            })
            .collect();
        groups.sort();
        groups
    }

    #[test]
    fn close_points_form_one_cluster() {
        let items = vec![(disc(0.0, 0.0, 50.0), 1), (disc(60.0, 0.0, 50.0), 2), (disc(120.0, 0.0, 50.0), 3)];
        let out = dissolve(items, &NullProgress).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(labels(&out), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn distant_points_stay_separate() {
        let items = vec![
            (disc(0.0, 0.0, 50.0), 1),
            (disc(10_000.0, 0.0, 50.0), 2),
            (disc(20_000.0, 0.0, 50.0), 3),
        ];
        let out = dissolve(items, &NullProgress).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn bridging_shape_merges_earlier_buckets() {
        // a and c are disjoint until b arrives; pass 1 puts b into c's bucket only
        let items = vec![(disc(0.0, 0.0, 10.0), 'a'), (disc(100.0, 0.0, 10.0), 'c'), (disc(50.0, 0.0, 45.0), 'b')];
        let out = dissolve(items, &NullProgress).unwrap();
        assert_eq!(labels(&out), vec![vec!['a', 'b', 'c']]);
    }

    #[test]
    fn permutations_give_same_partition() {
        let shapes = [
            disc(0.0, 0.0, 30.0),
            disc(40.0, 0.0, 30.0),
            disc(500.0, 500.0, 30.0),
            disc(80.0, 0.0, 30.0),
            disc(530.0, 500.0, 30.0),
            disc(5_000.0, 0.0, 30.0),
        ];
        let orders: [[usize; 6]; 4] = [[0, 1, 2, 3, 4, 5], [5, 4, 3, 2, 1, 0], [3, 0, 5, 2, 1, 4], [2, 5, 0, 4, 3, 1]];
        let expected = vec![vec![0, 1, 3], vec![2, 4], vec![5]];
        for order in orders {
            let items: Vec<_> = order.iter().map(|&i| (shapes[i].clone(), i)).collect();
            let out = dissolve(items, &NullProgress).unwrap();
            assert_eq!(labels(&out), expected, "order {order:?}");
        }
    }

    #[test]
    fn output_is_partition_and_clusters_are_disjoint() {
        let items: Vec<_> = (0..20)
            .map(|i| {
                let x = (i % 5) as f64 * 70.0 + (i / 10) as f64 * 2_000.0;
                (disc(x, 0.0, 40.0), i)
            })
            .collect();
        let out = dissolve(items, &NullProgress).unwrap();
        let mut all: Vec<i32> = out.iter().flat_map(|d| d.members.clone()).collect();
        all.sort();
        assert_eq!(all, (0..20).collect::<Vec<_>>());
        for (i, a) in out.iter().enumerate() {
            for b in &out[i + 1..] {
                assert!(!a.shape.intersects(&b.shape));
            }
        }
    }

    #[test]
    fn dissolving_output_again_is_stable() {
        let items: Vec<_> = (0..12).map(|i| (disc((i * 45) as f64 + (i / 4) as f64 * 1_000.0, 0.0, 25.0), i)).collect();
        let first = dissolve(items, &NullProgress).unwrap();
        let again: Vec<_> = first.iter().map(|d| (d.shape.clone(), ())).collect();
        let second = dissolve(again, &NullProgress).unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn empty_input_reports_completion() {
        let reporter = ProgressReporter::new("dissolve");
        let out = dissolve::<u8>(Vec::new(), &reporter).unwrap();
        assert!(out.is_empty());
        let p = reporter.snapshot();
        assert_eq!(p.percent, 100);
        assert_eq!(p.message, "Dissolve complete");
    }

    #[test]
    fn empty_shape_rejected() {
        let err = dissolve(vec![(MultiPolygon::new(Vec::new()), 0)], &NullProgress).unwrap_err();
        assert_eq!(err, GeometryError::Empty);
    }
}
