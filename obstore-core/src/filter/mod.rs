//! Query filters and their validation.
//!
//! A [`Filter`] intersects up to four constraints: a time range, a region of
//! interest, a producer set and a feature-of-interest set. Filters are checked
//! before any index is consulted so a malformed query never starts iterating.

mod cursor;
mod plan;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{Coord, Line, Polygon};
use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::index::contains_location;
use crate::key::{RecordKey, Timestamp};

pub use cursor::Cursor;
pub(crate) use plan::{Plan, Source, plan};

/// Inclusive time interval in seconds.
///
/// The range `(+inf, +inf)` is special: it selects the latest record of each
/// producer instead of an interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Lower bound, inclusive.
    pub start: f64,
    /// Upper bound, inclusive.
    pub end: f64,
}

impl TimeRange {
    /// Build a range; call [`Filter::validate`] to reject malformed bounds.
    #[must_use]
    pub const fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Range selecting the latest record of each producer.
    #[must_use]
    pub const fn latest() -> Self {
        Self::new(f64::INFINITY, f64::INFINITY)
    }

    /// Whether this range requests the latest record per producer.
    #[must_use]
    pub fn is_latest(&self) -> bool {
        self.start == f64::INFINITY && self.end == f64::INFINITY
    }

    /// Whether `timestamp` lies inside the range.
    #[must_use]
    pub fn contains(&self, timestamp: f64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    pub(crate) fn validate(&self) -> Result<(), FilterError> {
        if self.start.is_nan() || self.end.is_nan() {
            return Err(FilterError::NanTimeBound);
        }
        if self.start > self.end {
            return Err(FilterError::ReversedTimeRange {
                start: self.start.to_string(),
                end: self.end.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn bounds(&self) -> (Timestamp, Timestamp) {
        (
            Timestamp::new(self.start).unwrap_or(Timestamp::MIN),
            Timestamp::new(self.end).unwrap_or(Timestamp::MAX),
        )
    }
}

/// Order in which query results are yielded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultOrdering {
    /// Ascending `(producer, timestamp)`.
    #[default]
    ByProducerTime,
    /// Grouped by feature of interest (records without one first), then
    /// `(producer, timestamp)`.
    ByFoi,
}

impl ResultOrdering {
    /// Compare two keys under this ordering.
    #[must_use]
    pub fn compare(self, a: &RecordKey, b: &RecordKey) -> Ordering {
        let by_producer_time = || {
            a.producer_id
                .cmp(&b.producer_id)
                .then_with(|| a.timestamp.total_cmp(&b.timestamp))
        };
        match self {
            Self::ByProducerTime => by_producer_time(),
            Self::ByFoi => a.foi_id.cmp(&b.foi_id).then_with(by_producer_time),
        }
    }
}

/// Conjunction of query constraints. `None` means unconstrained.
///
/// # Examples
///
/// ```
/// use geo::polygon;
/// use obstore_core::{Filter, ResultOrdering};
///
/// let filter = Filter::new()
///     .with_time_range(0.0, 60.0)
///     .with_producers(["buoy-1", "buoy-2"])
///     .with_roi(polygon![(x: 0.0, y: 0.0), (x: 5.0, y: 0.0), (x: 5.0, y: 5.0)])
///     .ordered_by(ResultOrdering::ByFoi);
/// assert!(filter.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Inclusive time interval.
    pub time_range: Option<TimeRange>,
    /// Region of interest; boundary points match.
    pub roi: Option<Polygon<f64>>,
    /// Producers to include.
    pub producer_ids: Option<BTreeSet<String>>,
    /// Features of interest to include; records must reference one of them.
    pub foi_ids: Option<BTreeSet<String>>,
    /// Result ordering.
    #[serde(default)]
    pub ordering: ResultOrdering,
}

impl Filter {
    /// Filter matching every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to `start..=end`.
    #[must_use]
    pub const fn with_time_range(mut self, start: f64, end: f64) -> Self {
        self.time_range = Some(TimeRange::new(start, end));
        self
    }

    /// Select only the latest record of each producer.
    #[must_use]
    pub const fn latest(mut self) -> Self {
        self.time_range = Some(TimeRange::latest());
        self
    }

    /// Restrict to a region of interest.
    #[must_use]
    pub fn with_roi(mut self, roi: Polygon<f64>) -> Self {
        self.roi = Some(roi);
        self
    }

    /// Restrict to the given producers.
    #[must_use]
    pub fn with_producers<I, S>(mut self, producers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.producer_ids = Some(producers.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to records about the given features of interest.
    #[must_use]
    pub fn with_fois<I, S>(mut self, fois: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.foi_ids = Some(fois.into_iter().map(Into::into).collect());
        self
    }

    /// Choose the result ordering.
    #[must_use]
    pub const fn ordered_by(mut self, ordering: ResultOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Whether the time range asks for the latest record per producer.
    #[must_use]
    pub fn is_latest(&self) -> bool {
        self.time_range.as_ref().is_some_and(TimeRange::is_latest)
    }

    /// Reject malformed ranges and polygons.
    pub fn validate(&self) -> Result<(), FilterError> {
        if let Some(range) = &self.time_range {
            range.validate()?;
        }
        if let Some(roi) = &self.roi {
            validate_polygon(roi)?;
        }
        Ok(())
    }

    /// Whether a record passes every constraint except "latest" selection.
    ///
    /// `location` is the record's position, or `None` when it has none; a
    /// record without a position never matches a region of interest.
    #[must_use]
    pub fn admits(&self, key: &RecordKey, location: Option<(f64, f64)>) -> bool {
        if let Some(producers) = &self.producer_ids
            && !producers.contains(&key.producer_id)
        {
            return false;
        }
        if let Some(fois) = &self.foi_ids
            && !key.foi_id.as_ref().is_some_and(|foi| fois.contains(foi))
        {
            return false;
        }
        if let Some(range) = &self.time_range
            && !range.is_latest()
            && !range.contains(key.timestamp)
        {
            return false;
        }
        match (&self.roi, location) {
            (None, _) => true,
            (Some(roi), Some(location)) => contains_location(roi, location),
            (Some(_), None) => false,
        }
    }

    /// Whether every record this filter selects is also selected by `outer`.
    ///
    /// Regions are compared by equality; "latest" queries are never covered.
    #[must_use]
    pub fn is_within(&self, outer: &Self) -> bool {
        let sets_within = |inner: &Option<BTreeSet<String>>, outer: &Option<BTreeSet<String>>| {
            match (inner, outer) {
                (_, None) => true,
                (Some(inner), Some(outer)) => inner.is_subset(outer),
                (None, Some(_)) => false,
            }
        };
        let time_within = match (&self.time_range, &outer.time_range) {
            (Some(inner), _) if inner.is_latest() => false,
            (_, None) => true,
            (Some(inner), Some(outer)) => {
                !outer.is_latest() && outer.start <= inner.start && inner.end <= outer.end
            }
            (None, Some(_)) => false,
        };
        let roi_within = match (&self.roi, &outer.roi) {
            (_, None) => true,
            (Some(inner), Some(outer)) => inner == outer,
            (None, Some(_)) => false,
        };
        time_within
            && roi_within
            && sets_within(&self.producer_ids, &outer.producer_ids)
            && sets_within(&self.foi_ids, &outer.foi_ids)
    }
}

/// Check a region of interest for finite coordinates, at least three
/// distinct vertices and no self-intersection of its exterior ring.
pub fn validate_polygon(polygon: &Polygon<f64>) -> Result<(), FilterError> {
    let all_finite = polygon
        .exterior()
        .coords()
        .chain(polygon.interiors().iter().flat_map(|ring| ring.coords()))
        .all(|c| c.x.is_finite() && c.y.is_finite());
    if !all_finite {
        return Err(FilterError::NonFiniteCoordinate);
    }

    let mut vertices: Vec<Coord<f64>> = Vec::new();
    for coord in polygon.exterior().coords() {
        if vertices.last() != Some(coord) {
            vertices.push(*coord);
        }
    }
    if vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }

    let mut distinct = vertices.clone();
    distinct.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    distinct.dedup();
    if distinct.len() < 3 {
        return Err(FilterError::DegeneratePolygon {
            found: distinct.len(),
        });
    }

    let edges: Vec<Line<f64>> = vertices
        .iter()
        .zip(vertices.iter().cycle().skip(1))
        .map(|(a, b)| Line::new(*a, *b))
        .collect();
    let count = edges.len();
    for (i, first) in edges.iter().enumerate() {
        for (j, second) in edges.iter().enumerate().skip(i + 1) {
            let adjacent = j == i + 1 || (i == 0 && j == count - 1);
            match line_intersection(*first, *second) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return Err(FilterError::SelfIntersecting),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{LineString, polygon};
    use rstest::rstest;

    fn key(producer: &str, seconds: f64, foi: Option<&str>) -> RecordKey {
        let key = RecordKey::new(producer, seconds);
        match foi {
            Some(foi) => key.with_foi(foi),
            None => key,
        }
    }

    #[rstest]
    #[case(TimeRange::new(5.0, 1.0))]
    #[case(TimeRange::new(f64::NAN, 1.0))]
    #[case(TimeRange::new(0.0, f64::NAN))]
    fn malformed_ranges_are_rejected(#[case] range: TimeRange) {
        let filter = Filter {
            time_range: Some(range),
            ..Filter::default()
        };
        assert!(filter.validate().is_err());
    }

    #[rstest]
    fn latest_range_is_valid() {
        assert_eq!(Filter::new().latest().validate(), Ok(()));
        assert!(Filter::new().latest().is_latest());
    }

    #[rstest]
    fn bow_tie_is_self_intersecting() {
        let bow_tie = polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 2.0), (x: 2.0, y: 0.0), (x: 0.0, y: 2.0)];
        assert_eq!(validate_polygon(&bow_tie), Err(FilterError::SelfIntersecting));
    }

    #[rstest]
    fn spike_back_along_an_edge_is_self_intersecting() {
        let spike = polygon![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 3.0)];
        assert_eq!(validate_polygon(&spike), Err(FilterError::SelfIntersecting));
    }

    #[rstest]
    fn repeated_vertices_do_not_count_as_distinct() {
        let line = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)];
        assert_eq!(
            validate_polygon(&line),
            Err(FilterError::DegeneratePolygon { found: 2 })
        );
    }

    #[rstest]
    fn non_finite_vertices_are_rejected() {
        let ring = LineString::from(vec![(0.0, 0.0), (f64::INFINITY, 0.0), (1.0, 1.0)]);
        let polygon = Polygon::new(ring, Vec::new());
        assert_eq!(
            validate_polygon(&polygon),
            Err(FilterError::NonFiniteCoordinate)
        );
    }

    #[rstest]
    fn square_with_redundant_closing_vertex_is_valid() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0)];
        assert_eq!(validate_polygon(&square), Ok(()));
    }

    #[rstest]
    #[case(key("a", 5.0, Some("f")), Some((0.5, 0.5)), true)]
    #[case(key("b", 5.0, Some("f")), Some((0.5, 0.5)), false)]
    #[case(key("a", 11.0, Some("f")), Some((0.5, 0.5)), false)]
    #[case(key("a", 5.0, None), Some((0.5, 0.5)), false)]
    #[case(key("a", 5.0, Some("f")), Some((3.0, 0.5)), false)]
    #[case(key("a", 5.0, Some("f")), None, false)]
    fn admits_checks_every_constraint(
        #[case] key: RecordKey,
        #[case] location: Option<(f64, f64)>,
        #[case] expected: bool,
    ) {
        let filter = Filter::new()
            .with_time_range(0.0, 10.0)
            .with_producers(["a"])
            .with_fois(["f"])
            .with_roi(polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)]);
        assert_eq!(filter.admits(&key, location), expected);
    }

    #[rstest]
    fn narrower_filters_are_within_wider_ones() {
        let window = Filter::new().with_time_range(0.0, 100.0).with_producers(["a", "b"]);
        assert!(Filter::new()
            .with_time_range(10.0, 20.0)
            .with_producers(["a"])
            .is_within(&window));
        assert!(!Filter::new().with_time_range(10.0, 200.0).is_within(&window));
        assert!(!Filter::new().with_producers(["a"]).is_within(&window));
        assert!(!Filter::new().latest().is_within(&Filter::new()));
    }

    #[rstest]
    fn foi_ordering_groups_before_time() {
        let ordering = ResultOrdering::ByFoi;
        let early_b = key("p", 1.0, Some("b"));
        let late_a = key("p", 9.0, Some("a"));
        assert_eq!(ordering.compare(&late_a, &early_b), Ordering::Less);
        assert_eq!(
            ResultOrdering::ByProducerTime.compare(&late_a, &early_b),
            Ordering::Greater
        );
    }
}
