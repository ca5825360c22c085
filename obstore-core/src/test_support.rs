//! Fixtures shared by unit, integration and behaviour tests.
//!
//! Gated behind the `test-support` feature (and `cfg(test)`).

use geo::{Coord, Intersects, Polygon, Rect};

use crate::{FieldKind, RecordKey, RecordSchema, TupleWriter};

/// Spacing of [`scenario_records`] in seconds.
pub const SCENARIO_STEP_SECS: f64 = 0.1;

/// Schema with two `F64` fields used as the location.
///
/// # Examples
///
/// ```
/// use obstore_core::test_support::track_schema;
///
/// assert!(track_schema().has_location());
/// ```
#[must_use]
pub fn track_schema() -> RecordSchema {
    RecordSchema::new("x, y", vec![FieldKind::F64, FieldKind::F64])
        .and_then(|schema| schema.with_location(0, 1))
        .unwrap_or_else(|err| unreachable!("static schema is valid: {err}"))
}

/// Payload for [`track_schema`].
#[must_use]
pub fn xy_payload(x: f64, y: f64) -> Vec<u8> {
    TupleWriter::new().f64(x).f64(y).finish()
}

/// Records `0..count` from one producer, `0.1 s` apart, at
/// `(10 * i, 5 * i + 1)`.
pub fn scenario_records(
    producer: &str,
    count: u32,
) -> impl Iterator<Item = (RecordKey, Vec<u8>)> + '_ {
    (0..count).map(move |i| {
        let i = f64::from(i);
        (
            RecordKey::new(producer, i * SCENARIO_STEP_SECS),
            xy_payload(10.0 * i, 5.0 * i + 1.0),
        )
    })
}

/// Axis-aligned rectangle as a polygon.
#[must_use]
pub fn rectangle(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Polygon<f64> {
    Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y }).to_polygon()
}

/// Linear-scan reference for region queries; boundary points match.
///
/// Intended only for small datasets.
pub fn points_in_region<T>(
    points: impl IntoIterator<Item = (T, (f64, f64))>,
    region: &Polygon<f64>,
) -> Vec<T> {
    points
        .into_iter()
        .filter_map(|(item, (x, y))| region.intersects(&Coord { x, y }).then_some(item))
        .collect()
}
