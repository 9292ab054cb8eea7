//! Planar geometry helpers: envelopes, buffering, area, and the union/dissolve engine.
//!
//! All coordinates are projected metres.

pub mod dissolve;
pub mod union;

use geo::{
    Area, BoundingRect, Centroid, Coord, CoordsIter, Geometry, Intersects, LineString, MultiPolygon, Point,
    Polygon, Rect, coord,
};

use crate::limits::BUFFER_SEGMENTS;

pub use dissolve::{Dissolved, dissolve};
pub use union::{union_all, union_pair};

#[derive(Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// Nothing to operate on (no shapes, or a shape without coordinates).
    Empty,
    /// The overlay backend failed or produced invalid output.
    Topology(String),
    Unsupported(&'static str),
}

impl std::fmt::Display for GeometryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeometryError::Empty => write!(f, "empty geometry"),
            GeometryError::Topology(msg) => write!(f, "topology error: {msg}"),
            GeometryError::Unsupported(kind) => write!(f, "unsupported geometry: {kind}"),
        }
    }
}

impl std::error::Error for GeometryError {}

pub fn empty() -> MultiPolygon<f64> {
    MultiPolygon::new(Vec::new())
}

pub fn envelope(shape: &MultiPolygon<f64>) -> Option<Rect<f64>> {
    shape.bounding_rect()
}

pub fn expand_envelope(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
        coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
    )
}

/// Envelope test first, exact test second.
pub fn shapes_intersect(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    match (envelope(a), envelope(b)) {
        (Some(ea), Some(eb)) => ea.intersects(&eb) && a.intersects(b),
        _ => false,
    }
}

pub fn area(shape: &MultiPolygon<f64>) -> f64 {
    shape.unsigned_area()
}

pub fn centroid(shape: &MultiPolygon<f64>) -> Option<Point<f64>> {
    shape.centroid()
}

pub fn is_finite(shape: &MultiPolygon<f64>) -> bool {
    shape.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite())
}

/// Regular polygon approximating a disc.
pub fn circle(center: Coord<f64>, radius: f64) -> Polygon<f64> {
    let step = std::f64::consts::TAU / BUFFER_SEGMENTS as f64;
    let ring: Vec<Coord<f64>> = (0..=BUFFER_SEGMENTS)
        .map(|i| {
            let angle = step * (i % BUFFER_SEGMENTS) as f64;
            coord! { x: center.x + radius * angle.cos(), y: center.y + radius * angle.sin() }
        })
        .collect();
    Polygon::new(LineString::new(ring), Vec::new())
}

/// Polygonal part of a geometry, if it has one.
pub fn to_multi_polygon(shape: &Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match shape {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p.clone()])),
        Geometry::MultiPolygon(mp) => Some(mp.clone()),
        Geometry::Rect(r) => Some(MultiPolygon::new(vec![r.to_polygon()])),
        _ => None,
    }
}

/// Buffer a point or polygonal geometry outward by `distance` metres.
pub fn buffer(shape: &Geometry<f64>, distance: f64) -> Result<MultiPolygon<f64>, GeometryError> {
    match shape {
        Geometry::Point(p) if distance > 0.0 => Ok(MultiPolygon::new(vec![circle(p.0, distance)])),
        Geometry::Point(_) => Err(GeometryError::Unsupported("point buffered by zero distance")),
        Geometry::MultiPoint(points) if distance > 0.0 => {
            let discs: Vec<MultiPolygon<f64>> = points
                .iter()
                .map(|p| MultiPolygon::new(vec![circle(p.0, distance)]))
                .collect();
            union_all(&discs)
        }
        other => match to_multi_polygon(other) {
            Some(mp) => buffer_shape(&mp, distance),
            None => Err(GeometryError::Unsupported("non-polygonal geometry")),
        },
    }
}

/// Minkowski sum of a polygonal shape with a disc: the shape, a rectangle along each edge and a
/// disc at each vertex, unioned. Non-positive distances return the shape unchanged.
pub fn buffer_shape(shape: &MultiPolygon<f64>, distance: f64) -> Result<MultiPolygon<f64>, GeometryError> {
    if distance <= 0.0 || shape.0.is_empty() {
        return Ok(shape.clone());
    }
    let mut pieces = vec![shape.clone()];
    for polygon in shape {
        for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
            for line in ring.lines() {
                if let Some(rect) = edge_rectangle(line.start, line.end, distance) {
                    pieces.push(MultiPolygon::new(vec![rect]));
                }
                pieces.push(MultiPolygon::new(vec![circle(line.start, distance)]));
            }
        }
    }
    union_all(&pieces)
}

fn edge_rectangle(a: Coord<f64>, b: Coord<f64>, distance: f64) -> Option<Polygon<f64>> {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len = dx.hypot(dy);
    if len == 0.0 {
        return None;
    }
    let n = coord! { x: -dy / len * distance, y: dx / len * distance };
    let ring = vec![a + n, b + n, b - n, a - n, a + n];
    Some(Polygon::new(LineString::new(ring), Vec::new()))
}
