//! Read-side operations of [`ObservationStore`].

use std::collections::BTreeSet;
use std::sync::Arc;

use geo::Polygon;
use log::debug;

use super::{ObservationStore, Published, StreamState};
use crate::error::{FilterError, StoreError};
use crate::filter::{Cursor, Filter, Source, TimeRange, plan, validate_polygon};
use crate::key::{Record, RecordKey, StoreKey};
use crate::page::PageReader;
use crate::record::{PageEntry, PendingChange, RecordPage, page_of};
use crate::sync::{lock, read};

/// Default gap separating two time clusters, in seconds.
pub const DEFAULT_CLUSTER_GAP_SECS: f64 = 60.0;

fn stream_state<'a>(published: &'a Published, stream: &str) -> Result<&'a StreamState, StoreError> {
    published
        .streams
        .get(stream)
        .ok_or_else(|| StoreError::unknown_stream(stream))
}

impl ObservationStore {
    /// Lazily yield the committed records of `stream` that match `filter`.
    ///
    /// The filter is validated and planned before this returns; only page
    /// read failures surface during iteration.
    pub fn query(&self, stream: &str, filter: &Filter) -> Result<Cursor, StoreError> {
        // The reader is opened under the lock so it matches the table.
        let (plan, table, schema, reader) = {
            let published = read(&self.published);
            let state = stream_state(&published, stream)?;
            let plan = plan(&state.info, &state.index, filter)?;
            let reader = match plan.source {
                Source::Empty => None,
                _ => Some(PageReader::open(&self.path)?),
            };
            let table = Arc::clone(&published.table);
            (plan, table, Arc::clone(&state.schema), reader)
        };
        debug!("query on `{stream}` planned as {:?}", plan.source);
        Ok(Cursor::new(stream, plan, reader, table, self.bucket_span, schema))
    }

    /// Validate `filter` for `stream` without planning it.
    pub(crate) fn check_filter(&self, stream: &str, filter: &Filter) -> Result<(), StoreError> {
        filter.validate()?;
        let published = read(&self.published);
        let state = stream_state(&published, stream)?;
        if filter.roi.is_some() && !state.info.schema.has_location() {
            return Err(FilterError::RegionWithoutLocation {
                stream: stream.to_owned(),
            }
            .into());
        }
        Ok(())
    }

    /// Range scan over producers and time.
    pub fn scan(
        &self,
        stream: &str,
        producers: Option<&BTreeSet<String>>,
        time_range: Option<TimeRange>,
    ) -> Result<Cursor, StoreError> {
        let filter = Filter {
            time_range,
            producer_ids: producers.cloned(),
            ..Filter::default()
        };
        self.query(stream, &filter)
    }

    /// Fetch one committed record.
    pub fn get(&self, stream: &str, key: &RecordKey) -> Result<Record, StoreError> {
        let store_key = key
            .store_key()
            .ok_or_else(|| StoreError::nan_timestamp(key))?;
        let not_found = || StoreError::NotFound {
            what: format!(
                "record ({}, {}) in stream `{stream}`",
                store_key.producer_id, store_key.timestamp
            ),
        };
        let (page, mut reader) = {
            let published = read(&self.published);
            let state = stream_state(&published, stream)?;
            if state.index.meta(&store_key).is_none() {
                return Err(not_found());
            }
            let page = published
                .table
                .get(&page_of(stream, &store_key, self.bucket_span))
                .copied()
                .ok_or_else(not_found)?;
            (page, PageReader::open(&self.path)?)
        };
        let mut decoded: RecordPage = reader.read_value(page)?;
        decoded
            .remove(&store_key.timestamp)
            .map(|entry: PageEntry| entry.into_record(&store_key.producer_id, store_key.timestamp))
            .ok_or_else(not_found)
    }

    /// Keys of every committed record located inside `region`.
    ///
    /// Points on the boundary match.
    pub fn query_region(
        &self,
        stream: &str,
        region: &Polygon<f64>,
    ) -> Result<BTreeSet<RecordKey>, StoreError> {
        validate_polygon(region)?;
        {
            let published = read(&self.published);
            let state = stream_state(&published, stream)?;
            if !state.info.schema.has_location() {
                return Err(FilterError::RegionWithoutLocation {
                    stream: stream.to_owned(),
                }
                .into());
            }
            if let Some(spatial) = state.index.spatial() {
                return Ok(spatial
                    .query_region(region)
                    .into_iter()
                    .map(|key| {
                        let foi = state.index.meta(&key).and_then(|meta| meta.foi_id.clone());
                        RecordKey::from((key, foi))
                    })
                    .collect());
            }
        }
        self.query(stream, &Filter::new().with_roi(region.clone()))?
            .map(|record| record.map(|record| record.key))
            .collect()
    }

    /// Buffer the removal of every record matching `filter`.
    ///
    /// Buffered appends that match are dropped as well, except for "latest"
    /// filters, which only consider committed records. Returns the number of
    /// records marked for removal.
    pub fn remove_matching(&self, stream: &str, filter: &Filter) -> Result<usize, StoreError> {
        let schema = self.stream(stream)?.schema.clone();
        let mut keys: BTreeSet<StoreKey> = BTreeSet::new();
        for record in self.query(stream, filter)? {
            if let Some(key) = record?.key.store_key() {
                keys.insert(key);
            }
        }

        let mut pending = lock(&self.pending);
        if !filter.is_latest()
            && let Some(changes) = pending.stream(stream)
        {
            for (key, change) in changes {
                let PendingChange::Upsert {
                    foi_id, payload, ..
                } = change
                else {
                    continue;
                };
                let location = schema.location(payload).ok().flatten();
                let record_key = RecordKey::from((key.clone(), foi_id.clone()));
                if filter.admits(&record_key, location) {
                    keys.insert(key.clone());
                }
            }
        }
        let removed = keys.len();
        for key in keys {
            pending.record(stream, key, PendingChange::Remove);
        }
        Ok(removed)
    }

    /// Number of committed records matching `filter`, capped at `max`.
    pub fn count(&self, stream: &str, filter: &Filter, max: usize) -> Result<usize, StoreError> {
        {
            let published = read(&self.published);
            let state = stream_state(&published, stream)?;
            let plan = plan(&state.info, &state.index, filter)?;
            if plan.post_region.is_none() {
                let total = match plan.source {
                    Source::Empty => 0,
                    Source::Keys(keys) => keys.len(),
                    Source::Scan { producers, range } => producers
                        .iter()
                        .filter_map(|producer| state.index.timeline(producer))
                        .map(|timeline| timeline.range(range.0..=range.1).count())
                        .sum(),
                };
                return Ok(total.min(max));
            }
        }
        let mut total = 0;
        for record in self.query(stream, filter)?.take(max) {
            record?;
            total += 1;
        }
        Ok(total)
    }

    /// Committed record count of `stream`.
    pub fn record_count(&self, stream: &str) -> Result<usize, StoreError> {
        let published = read(&self.published);
        Ok(stream_state(&published, stream)?.index.len())
    }

    /// Earliest and latest committed timestamps, over one producer or all.
    pub fn time_range(
        &self,
        stream: &str,
        producer: Option<&str>,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let published = read(&self.published);
        let state = stream_state(&published, stream)?;
        let bounds = state
            .index
            .producers()
            .iter()
            .filter(|(name, _)| producer.is_none_or(|wanted| wanted == name.as_str()))
            .filter_map(|(_, timeline)| {
                Some((*timeline.first_key_value()?.0, *timeline.last_key_value()?.0))
            })
            .reduce(|(lo, hi), (first, last)| (lo.min(first), hi.max(last)));
        Ok(bounds.map(|(lo, hi)| (lo.seconds(), hi.seconds())))
    }

    /// Split a producer's timeline into runs whose consecutive records are
    /// at most `max_gap` seconds apart.
    ///
    /// Each run is reported as its first and last timestamp.
    pub fn time_clusters(
        &self,
        stream: &str,
        producer: &str,
        max_gap: f64,
    ) -> Result<Vec<(f64, f64)>, StoreError> {
        if max_gap.is_nan() || max_gap < 0.0 {
            return Err(FilterError::InvalidClusterGap {
                gap: max_gap.to_string(),
            }
            .into());
        }
        let published = read(&self.published);
        let state = stream_state(&published, stream)?;
        let Some(timeline) = state.index.timeline(producer) else {
            return Ok(Vec::new());
        };
        let mut clusters: Vec<(f64, f64)> = Vec::new();
        for timestamp in timeline.keys().map(|ts| ts.seconds()) {
            match clusters.last_mut() {
                Some((_, end)) if timestamp - *end <= max_gap => *end = timestamp,
                _ => clusters.push((timestamp, timestamp)),
            }
        }
        Ok(clusters)
    }

    /// Count committed records in each window `[t[i], t[i + 1])`.
    ///
    /// `producer` limits the count to one producer. Boundaries must be
    /// non-decreasing.
    pub fn estimated_record_counts(
        &self,
        stream: &str,
        producer: Option<&str>,
        boundaries: &[f64],
    ) -> Result<Vec<usize>, StoreError> {
        for pair in boundaries.windows(2) {
            TimeRange::new(pair[0], pair[1]).validate()?;
        }
        let published = read(&self.published);
        let state = stream_state(&published, stream)?;
        let timelines: Vec<_> = state
            .index
            .producers()
            .iter()
            .filter(|(name, _)| producer.is_none_or(|wanted| wanted == name.as_str()))
            .map(|(_, timeline)| timeline)
            .collect();
        Ok(boundaries
            .windows(2)
            .map(|pair| {
                let (start, end) = TimeRange::new(pair[0], pair[1]).bounds();
                timelines
                    .iter()
                    .map(|timeline| timeline.range(start..end).count())
                    .sum()
            })
            .collect())
    }

    /// Features of interest referenced by committed records.
    pub fn foi_ids(
        &self,
        stream: &str,
        producer: Option<&str>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let published = read(&self.published);
        let state = stream_state(&published, stream)?;
        let Some(producer) = producer else {
            return Ok(state.index.foi_ids().cloned().collect());
        };
        Ok(state
            .index
            .timeline(producer)
            .into_iter()
            .flat_map(|timeline| timeline.values())
            .filter_map(|meta| meta.foi_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::{FieldKind, RecordSchema, TupleWriter};
    use camino::Utf8PathBuf;
    use geo::polygon;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: ObservationStore,
    }

    fn xy(x: f64, y: f64) -> Vec<u8> {
        TupleWriter::new().f64(x).f64(y).finish()
    }

    #[fixture]
    fn populated() -> Fixture {
        let dir = TempDir::new().expect("create temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("store.obs")).expect("utf-8 path");
        let store = ObservationStore::open(&StoreConfig::new(path)).expect("open store");
        let schema = RecordSchema::new("x, y", vec![FieldKind::F64, FieldKind::F64])
            .and_then(|s| s.with_location(0, 1))
            .expect("valid schema");
        let handle = store.open_stream("track", schema, true).expect("create stream");
        for (producer, seconds, foi, x) in [
            ("a", 0.0, Some("reef"), 0.0),
            ("a", 10.0, Some("reef"), 1.0),
            ("a", 200.0, None, 2.0),
            ("a", 230.0, Some("bay"), 3.0),
            ("b", 5.0, Some("bay"), 4.0),
        ] {
            let key = RecordKey::new(producer, seconds);
            let key = match foi {
                Some(foi) => key.with_foi(foi),
                None => key,
            };
            store.append(&handle, key, xy(x, 0.0)).expect("append");
        }
        store.commit().expect("commit");
        Fixture { _dir: dir, store }
    }

    #[rstest]
    fn get_returns_the_stored_payload(populated: Fixture) {
        let record = populated
            .store
            .get("track", &RecordKey::new("a", 10.0))
            .expect("record exists");
        assert_eq!(record.payload, xy(1.0, 0.0));
        assert_eq!(record.key.foi_id.as_deref(), Some("reef"));
    }

    #[rstest]
    fn missing_records_and_streams_are_not_found(populated: Fixture) {
        assert!(matches!(
            populated.store.get("track", &RecordKey::new("a", 11.0)),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            populated.store.query("nope", &Filter::new()),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[rstest]
    fn region_lookup_includes_the_boundary(populated: Fixture) {
        let region = polygon![(x: 1.0, y: -1.0), (x: 3.0, y: -1.0), (x: 3.0, y: 1.0), (x: 1.0, y: 1.0)];
        let keys = populated.store.query_region("track", &region).expect("valid region");
        let times: Vec<f64> = keys.iter().map(|key| key.timestamp).collect();
        assert_eq!(times, vec![10.0, 200.0, 230.0]);
    }

    #[rstest]
    fn clusters_split_on_large_gaps(populated: Fixture) {
        let clusters = populated
            .store
            .time_clusters("track", "a", DEFAULT_CLUSTER_GAP_SECS)
            .expect("valid gap");
        assert_eq!(clusters, vec![(0.0, 10.0), (200.0, 230.0)]);
        assert!(matches!(
            populated.store.time_clusters("track", "a", -1.0),
            Err(StoreError::InvalidFilter(FilterError::InvalidClusterGap { .. }))
        ));
    }

    #[rstest]
    fn histogram_uses_half_open_windows(populated: Fixture) {
        let counts = populated
            .store
            .estimated_record_counts("track", None, &[0.0, 10.0, 200.0, 1000.0])
            .expect("valid boundaries");
        assert_eq!(counts, vec![2, 1, 2]);
        let only_b = populated
            .store
            .estimated_record_counts("track", Some("b"), &[0.0, 10.0])
            .expect("valid boundaries");
        assert_eq!(only_b, vec![1]);
    }

    #[rstest]
    fn time_range_and_fois_follow_the_producer(populated: Fixture) {
        let store = &populated.store;
        assert_eq!(store.time_range("track", None).expect("stream"), Some((0.0, 230.0)));
        assert_eq!(store.time_range("track", Some("b")).expect("stream"), Some((5.0, 5.0)));
        assert_eq!(store.time_range("track", Some("zz")).expect("stream"), None);
        let fois = store.foi_ids("track", Some("b")).expect("stream");
        assert_eq!(fois, BTreeSet::from([String::from("bay")]));
        assert_eq!(store.foi_ids("track", None).expect("stream").len(), 2);
    }

    #[rstest]
    fn count_is_capped(populated: Fixture) {
        let store = &populated.store;
        assert_eq!(store.count("track", &Filter::new(), usize::MAX).expect("count"), 5);
        assert_eq!(store.count("track", &Filter::new(), 3).expect("count"), 3);
        let latest = Filter::new().latest();
        assert_eq!(store.count("track", &latest, usize::MAX).expect("count"), 2);
    }

    #[rstest]
    fn remove_matching_covers_committed_and_buffered_records(populated: Fixture) {
        let store = &populated.store;
        let handle = store.stream("track").expect("stream exists");
        store
            .append(&handle, RecordKey::new("a", 220.0), xy(9.0, 9.0))
            .expect("append");
        let removed = store
            .remove_matching("track", &Filter::new().with_producers(["a"]).with_time_range(100.0, 300.0))
            .expect("valid filter");
        assert_eq!(removed, 3);
        store.commit().expect("commit");
        let remaining: Vec<f64> = store
            .scan("track", None, None)
            .expect("scan")
            .map(|record| record.expect("readable").key.timestamp)
            .collect();
        assert_eq!(remaining, vec![0.0, 10.0, 5.0]);
    }
}
