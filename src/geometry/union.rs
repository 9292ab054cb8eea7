use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use geo::{BooleanOps, Coord, MapCoords, MultiPolygon, SimplifyVwPreserve};
use metrics::counter;
use tracing::warn;

use super::{GeometryError, is_finite};
use crate::observability::UNION_FALLBACKS_TOTAL;

/// Distance tolerance (metres) of the second-tier simplification.
pub const SIMPLIFY_TOLERANCE: f64 = 10.0;

/// Grid scale of the third tier: coordinates snap to multiples of `1 / PRECISION_SCALE`.
pub const PRECISION_SCALE: f64 = 8.0;

/// Union every shape into one. Zero shapes is an error; a single shape comes back unchanged.
pub fn union_all(shapes: &[MultiPolygon<f64>]) -> Result<MultiPolygon<f64>, GeometryError> {
    match shapes {
        [] => Err(GeometryError::Empty),
        [only] => Ok(only.clone()),
        _ => union_with(shapes, overlay_union),
    }
}

pub fn union_pair(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>, GeometryError> {
    if a.0.is_empty() {
        return Ok(b.clone());
    }
    if b.0.is_empty() {
        return Ok(a.clone());
    }
    union_with(&[a.clone(), b.clone()], overlay_union)
}

/// Runs `op` on the inputs, then on simplified inputs, then on grid-snapped inputs.
/// Only the last failure is returned.
pub(crate) fn union_with<F>(shapes: &[MultiPolygon<f64>], op: F) -> Result<MultiPolygon<f64>, GeometryError>
where
    F: Fn(&[MultiPolygon<f64>]) -> Result<MultiPolygon<f64>, GeometryError>,
{
    let err = match op(shapes) {
        Ok(result) => return Ok(result),
        Err(e) => e,
    };
    warn!("union of {} shapes failed ({err}), retrying on simplified input", shapes.len());
    counter!(UNION_FALLBACKS_TOTAL, "tier" => "simplify").increment(1);

    let epsilon = SIMPLIFY_TOLERANCE * SIMPLIFY_TOLERANCE;
    let simplified: Vec<MultiPolygon<f64>> = shapes.iter().map(|s| s.simplify_vw_preserve(&epsilon)).collect();
    let err = match op(&simplified) {
        Ok(result) => return Ok(result),
        Err(e) => e,
    };
    warn!("union of simplified shapes failed ({err}), retrying on snapped input");
    counter!(UNION_FALLBACKS_TOTAL, "tier" => "precision").increment(1);

    let snapped: Vec<MultiPolygon<f64>> = shapes.iter().map(snap_to_grid).collect();
    op(&snapped)
}

fn snap_to_grid(shape: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    shape.map_coords(|c| Coord {
        x: (c.x * PRECISION_SCALE).round() / PRECISION_SCALE,
        y: (c.y * PRECISION_SCALE).round() / PRECISION_SCALE,
    })
}

/// Cascaded pairwise union: neighbours are unioned level by level so operand sizes stay balanced.
fn overlay_union(shapes: &[MultiPolygon<f64>]) -> Result<MultiPolygon<f64>, GeometryError> {
    let mut level: Vec<MultiPolygon<f64>> = shapes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut iter = level.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => next.push(checked_union(&a, &b)?),
                None => next.push(a),
            }
        }
        level = next;
    }
    level.pop().ok_or(GeometryError::Empty)
}

fn checked_union(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>, GeometryError> {
    let result = catch_unwind(AssertUnwindSafe(|| a.union(b)))
        .map_err(|payload| GeometryError::Topology(panic_message(payload.as_ref())))?;
    if !is_finite(&result) {
        return Err(GeometryError::Topology("non-finite coordinate in union result".into()));
    }
    Ok(result)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "overlay backend panicked".to_string()
    }
}
