//! Property-based tests for region and filter queries.
//!
//! # Invariants tested
//!
//! - **Spatial exactness:** region queries return exactly the records whose
//!   location lies in the polygon, boundary included, with no false positives
//!   from the bounding-box pre-filter.
//! - **Filter composition:** a time range combined with a region selects the
//!   intersection of the two individual queries.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use geo::{Polygon, polygon};
use obstore_core::test_support::{points_in_region, track_schema, xy_payload};
use obstore_core::{Filter, ObservationStore, RecordKey, StoreConfig};
use proptest::prelude::*;
use tempfile::TempDir;

type Point = (f64, f64);

fn open_store(points: &[Point]) -> (TempDir, ObservationStore) {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("prop.obs")).expect("utf-8 path");
    let store = ObservationStore::open(&StoreConfig::new(path)).expect("open store");
    let track = store.open_stream("track", track_schema(), true).expect("stream");
    for (i, (x, y)) in points.iter().enumerate() {
        let seconds = f64::from(u32::try_from(i).expect("small index"));
        store
            .append(&track, RecordKey::new("p", seconds), xy_payload(*x, *y))
            .expect("append");
    }
    store.commit().expect("commit");
    (dir, store)
}

fn expected_keys(points: &[Point], region: &Polygon<f64>) -> BTreeSet<RecordKey> {
    let keyed = points.iter().enumerate().map(|(i, point)| {
        let seconds = f64::from(u32::try_from(i).expect("small index"));
        (RecordKey::new("p", seconds), *point)
    });
    points_in_region(keyed, region).into_iter().collect()
}

/// Grid-aligned coordinates so points regularly fall on polygon edges.
fn point_strategy() -> impl Strategy<Value = Point> {
    (0_i32..=40, 0_i32..=40).prop_map(|(x, y)| (f64::from(x) * 0.5, f64::from(y) * 0.5))
}

/// A triangle, which never self-intersects, with a bounding box much larger
/// than its area.
fn triangle_strategy() -> impl Strategy<Value = Polygon<f64>> {
    (0_i32..=10, 0_i32..=10, 11_i32..=20, 11_i32..=20).prop_map(|(x0, y0, x1, y1)| {
        let (x0, y0, x1, y1) = (f64::from(x0), f64::from(y0), f64::from(x1), f64::from(y1));
        polygon![(x: x0, y: y0), (x: x1, y: y0), (x: x0, y: y1)]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn region_queries_match_a_linear_scan(
        points in prop::collection::vec(point_strategy(), 1..80),
        region in triangle_strategy(),
    ) {
        let (_dir, store) = open_store(&points);
        let indexed = store.query_region("track", &region).expect("valid region");
        prop_assert_eq!(indexed, expected_keys(&points, &region));

        let filtered: BTreeSet<RecordKey> = store
            .query("track", &Filter::new().with_roi(region.clone()))
            .expect("valid query")
            .map(|record| record.expect("readable").key)
            .collect();
        prop_assert_eq!(filtered, expected_keys(&points, &region));
    }

    #[test]
    fn time_and_region_compose(
        points in prop::collection::vec(point_strategy(), 1..80),
        region in triangle_strategy(),
        start in 0_u32..40,
        span in 0_u32..40,
    ) {
        let (_dir, store) = open_store(&points);
        let (start, end) = (f64::from(start), f64::from(start + span));
        let collect = |filter: Filter| -> BTreeSet<RecordKey> {
            store
                .query("track", &filter)
                .expect("valid query")
                .map(|record| record.expect("readable").key)
                .collect()
        };
        let by_time = collect(Filter::new().with_time_range(start, end));
        let by_region = collect(Filter::new().with_roi(region.clone()));
        let both = collect(Filter::new().with_time_range(start, end).with_roi(region));
        let expected: BTreeSet<RecordKey> = by_time.intersection(&by_region).cloned().collect();
        prop_assert_eq!(both, expected);
    }
}
