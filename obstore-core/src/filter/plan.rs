//! Turn a validated filter into an access plan over one stream's indices.
//!
//! Constraints are applied cheapest first: producer set, then FOI union, then
//! the spatial lookup, then the time sub-range. As soon as an intermediate
//! set is empty the plan short-circuits. A "latest" query picks the newest
//! record per producer before the region of interest is checked.

use std::collections::BTreeSet;

use geo::Polygon;

use super::{Filter, ResultOrdering};
use crate::error::FilterError;
use crate::index::{StreamIndex, contains_location};
use crate::key::{StoreKey, Timestamp};
use crate::record::StreamInfo;

/// How records are fetched from the page store.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Source {
    /// Nothing can match.
    Empty,
    /// Walk the pages of each producer, keeping timestamps inside `range`.
    Scan {
        producers: Vec<String>,
        range: (Timestamp, Timestamp),
    },
    /// Fetch exactly these keys, in this order.
    Keys(Vec<StoreKey>),
}

/// Access plan for one query.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub(crate) source: Source,
    /// Region checked against payload locations during iteration, used when
    /// the stream has location fields but no spatial index.
    pub(crate) post_region: Option<Polygon<f64>>,
}

impl Plan {
    const fn empty() -> Self {
        Self {
            source: Source::Empty,
            post_region: None,
        }
    }
}

/// Validate `filter` against `info` and plan it over `index`.
pub(crate) fn plan(
    info: &StreamInfo,
    index: &StreamIndex,
    filter: &Filter,
) -> Result<Plan, FilterError> {
    filter.validate()?;
    if filter.roi.is_some() && !info.schema.has_location() {
        return Err(FilterError::RegionWithoutLocation {
            stream: info.name.clone(),
        });
    }

    let producers: Vec<String> = match &filter.producer_ids {
        Some(ids) => ids
            .iter()
            .filter(|id| index.timeline(id).is_some())
            .cloned()
            .collect(),
        None => index.producers().keys().cloned().collect(),
    };
    if producers.is_empty() {
        return Ok(Plan::empty());
    }
    let selected: BTreeSet<&str> = producers.iter().map(String::as_str).collect();

    let mut candidates: Option<BTreeSet<StoreKey>> = None;
    if let Some(fois) = &filter.foi_ids {
        let keys: BTreeSet<StoreKey> = fois
            .iter()
            .filter_map(|foi| index.foi_keys(foi))
            .flatten()
            .filter(|key| selected.contains(key.producer_id.as_str()))
            .cloned()
            .collect();
        if keys.is_empty() {
            return Ok(Plan::empty());
        }
        candidates = Some(keys);
    }

    if filter.is_latest() {
        return Ok(latest_plan(index, &producers, candidates.as_ref(), filter));
    }

    let mut post_region = None;
    if let Some(roi) = &filter.roi {
        match index.spatial() {
            Some(spatial) => {
                let keys: BTreeSet<StoreKey> = spatial
                    .query_region(roi)
                    .into_iter()
                    .filter(|key| selected.contains(key.producer_id.as_str()))
                    .filter(|key| candidates.as_ref().is_none_or(|set| set.contains(key)))
                    .collect();
                if keys.is_empty() {
                    return Ok(Plan::empty());
                }
                candidates = Some(keys);
            }
            None => post_region = Some(roi.clone()),
        }
    }

    let source = match (filter.time_range, candidates) {
        (Some(range), Some(keys)) => {
            let (start, end) = range.bounds();
            Source::Keys(
                keys.into_iter()
                    .filter(|key| start <= key.timestamp && key.timestamp <= end)
                    .collect(),
            )
        }
        (None, Some(keys)) => Source::Keys(keys.into_iter().collect()),
        (range, None) => Source::Scan {
            producers,
            range: range.map_or((Timestamp::MIN, Timestamp::MAX), |r| r.bounds()),
        },
    };

    Ok(Plan {
        source: finish(source, index, filter.ordering),
        post_region,
    })
}

fn finish(source: Source, index: &StreamIndex, ordering: ResultOrdering) -> Source {
    match source {
        Source::Keys(keys) if keys.is_empty() => Source::Empty,
        other => order(other, index, ordering),
    }
}

/// Newest key per producer among the producer and FOI candidates; the
/// region is checked only against those keys.
fn latest_plan(
    index: &StreamIndex,
    producers: &[String],
    candidates: Option<&BTreeSet<StoreKey>>,
    filter: &Filter,
) -> Plan {
    let mut keys = latest_keys(index, producers, candidates);
    let mut post_region = None;
    if let Some(roi) = &filter.roi {
        match index.spatial() {
            Some(_) => keys.retain(|key| {
                index
                    .meta(key)
                    .and_then(|meta| meta.location)
                    .is_some_and(|location| contains_location(roi, location))
            }),
            None => post_region = Some(roi.clone()),
        }
    }
    Plan {
        source: finish(Source::Keys(keys), index, filter.ordering),
        post_region,
    }
}

fn latest_keys(
    index: &StreamIndex,
    producers: &[String],
    candidates: Option<&BTreeSet<StoreKey>>,
) -> Vec<StoreKey> {
    producers
        .iter()
        .filter_map(|producer| match candidates {
            Some(set) => set
                .range(
                    StoreKey::new(producer.as_str(), Timestamp::MIN)
                        ..=StoreKey::new(producer.as_str(), Timestamp::MAX),
                )
                .next_back()
                .cloned(),
            None => index
                .timeline(producer)
                .and_then(|timeline| timeline.last_key_value())
                .map(|(ts, _)| StoreKey::new(producer.as_str(), *ts)),
        })
        .collect()
}

/// Materialise FOI ordering; producer/time order is already the natural one.
fn order(source: Source, index: &StreamIndex, ordering: ResultOrdering) -> Source {
    if ordering == ResultOrdering::ByProducerTime {
        return source;
    }
    let mut keys = match source {
        Source::Empty => return Source::Empty,
        Source::Keys(keys) => keys,
        Source::Scan { producers, range } => producers
            .iter()
            .filter_map(|producer| index.timeline(producer).map(|t| (producer, t)))
            .flat_map(|(producer, timeline)| {
                timeline
                    .range(range.0..=range.1)
                    .map(move |(ts, _)| StoreKey::new(producer.as_str(), *ts))
            })
            .collect(),
    };
    let foi = |key: &StoreKey| index.meta(key).and_then(|meta| meta.foi_id.clone());
    keys.sort_by_cached_key(|key| (foi(key), key.clone()));
    if keys.is_empty() {
        Source::Empty
    } else {
        Source::Keys(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::KeyMeta;
    use crate::schema::{FieldKind, RecordSchema};
    use geo::polygon;
    use rstest::{fixture, rstest};

    fn key(producer: &str, seconds: f64) -> StoreKey {
        StoreKey::new(producer, Timestamp::new(seconds).expect("not NaN"))
    }

    #[fixture]
    fn info() -> StreamInfo {
        StreamInfo {
            name: String::from("track"),
            schema: RecordSchema::new("xy", vec![FieldKind::F64, FieldKind::F64])
                .and_then(|s| s.with_location(0, 1))
                .expect("valid schema"),
            index_spatial: true,
        }
    }

    #[fixture]
    fn index() -> StreamIndex {
        let mut index = StreamIndex::new(true);
        for (producer, seconds, foi, x) in [
            ("a", 1.0, Some("north"), 1.0),
            ("a", 2.0, Some("south"), 2.0),
            ("a", 3.0, None, 3.0),
            ("b", 1.5, Some("north"), 10.0),
        ] {
            index.insert(
                key(producer, seconds),
                KeyMeta {
                    foi_id: foi.map(str::to_owned),
                    location: Some((x, 0.0)),
                },
            );
        }
        index
    }

    #[rstest]
    fn producer_and_time_only_plans_a_scan(info: StreamInfo, index: StreamIndex) {
        let filter = Filter::new().with_producers(["a", "missing"]).with_time_range(1.5, 9.0);
        let planned = plan(&info, &index, &filter).expect("valid filter");
        let Source::Scan { producers, range } = planned.source else {
            panic!("expected a scan, got {:?}", planned.source);
        };
        assert_eq!(producers, vec![String::from("a")]);
        assert_eq!(range.0.seconds(), 1.5);
    }

    #[rstest]
    fn unknown_producers_short_circuit(info: StreamInfo, index: StreamIndex) {
        let filter = Filter::new().with_producers(["nobody"]);
        let planned = plan(&info, &index, &filter).expect("valid filter");
        assert_eq!(planned.source, Source::Empty);
    }

    #[rstest]
    fn foi_and_region_intersect(info: StreamInfo, index: StreamIndex) {
        let filter = Filter::new()
            .with_fois(["north"])
            .with_roi(polygon![(x: 0.0, y: -1.0), (x: 5.0, y: -1.0), (x: 5.0, y: 1.0), (x: 0.0, y: 1.0)]);
        let planned = plan(&info, &index, &filter).expect("valid filter");
        assert_eq!(planned.source, Source::Keys(vec![key("a", 1.0)]));
        assert!(planned.post_region.is_none());
    }

    #[rstest]
    fn latest_picks_the_last_key_per_producer(info: StreamInfo, index: StreamIndex) {
        let planned = plan(&info, &index, &Filter::new().latest()).expect("valid filter");
        assert_eq!(
            planned.source,
            Source::Keys(vec![key("a", 3.0), key("b", 1.5)])
        );
    }

    #[rstest]
    #[case::newest_outside(0.0, 1.5, Vec::new())]
    #[case::newest_inside(2.5, 3.5, vec![("a", 3.0)])]
    fn latest_is_picked_before_the_region_applies(
        info: StreamInfo,
        index: StreamIndex,
        #[case] min_x: f64,
        #[case] max_x: f64,
        #[case] expected: Vec<(&str, f64)>,
    ) {
        let roi = polygon![
            (x: min_x, y: -1.0),
            (x: max_x, y: -1.0),
            (x: max_x, y: 1.0),
            (x: min_x, y: 1.0)
        ];
        let planned = plan(&info, &index, &Filter::new().latest().with_roi(roi))
            .expect("valid filter");
        let expected: Vec<StoreKey> = expected.into_iter().map(|(p, t)| key(p, t)).collect();
        if expected.is_empty() {
            assert_eq!(planned.source, Source::Empty);
        } else {
            assert_eq!(planned.source, Source::Keys(expected));
        }
        assert!(planned.post_region.is_none());
    }

    #[rstest]
    fn foi_ordering_groups_keys(info: StreamInfo, index: StreamIndex) {
        let filter = Filter::new().ordered_by(ResultOrdering::ByFoi);
        let planned = plan(&info, &index, &filter).expect("valid filter");
        assert_eq!(
            planned.source,
            Source::Keys(vec![
                key("a", 3.0),
                key("a", 1.0),
                key("b", 1.5),
                key("a", 2.0),
            ])
        );
    }

    #[rstest]
    fn region_without_spatial_index_becomes_a_post_filter(info: StreamInfo) {
        let mut index = StreamIndex::new(false);
        index.insert(key("a", 1.0), KeyMeta { foi_id: None, location: None });
        let roi = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)];
        let planned = plan(&info, &index, &Filter::new().with_roi(roi.clone()))
            .expect("valid filter");
        assert_eq!(planned.post_region, Some(roi));
        assert!(matches!(planned.source, Source::Scan { .. }));
    }

    #[rstest]
    fn region_on_stream_without_location_is_invalid(index: StreamIndex) {
        let info = StreamInfo {
            name: String::from("plain"),
            schema: RecordSchema::new("v", vec![FieldKind::F64]).expect("valid schema"),
            index_spatial: false,
        };
        let roi = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)];
        let err = plan(&info, &index, &Filter::new().with_roi(roi)).expect_err("no location");
        assert!(matches!(err, FilterError::RegionWithoutLocation { .. }));
    }
}
