//! Secondary indices kept in memory for each stream.
//!
//! - time and producer: per-producer ordered timestamps with key metadata
//! - feature of interest: FOI id to the ordered set of keys that reference it
//! - spatial: an R\*-tree of record locations, when the stream indexes them
//!
//! Indices are rebuilt from the committed pages when a store opens and are
//! updated from the deltas of each successful commit.

mod spatial;

use std::collections::{BTreeMap, BTreeSet};

use crate::key::{StoreKey, Timestamp};

pub(crate) use spatial::{SpatialEntry, SpatialIndex, contains_location};

/// Metadata carried alongside each indexed key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyMeta {
    pub(crate) foi_id: Option<String>,
    /// Present only when the record is in the spatial index.
    pub(crate) location: Option<(f64, f64)>,
}

/// Per-producer timestamps with metadata.
pub(crate) type ProducerTimeline = BTreeMap<Timestamp, KeyMeta>;

/// All indices of one stream.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamIndex {
    producers: BTreeMap<String, ProducerTimeline>,
    fois: BTreeMap<String, BTreeSet<StoreKey>>,
    spatial: Option<SpatialIndex>,
}

impl StreamIndex {
    pub(crate) fn new(spatial: bool) -> Self {
        Self {
            producers: BTreeMap::new(),
            fois: BTreeMap::new(),
            spatial: spatial.then(SpatialIndex::default),
        }
    }

    /// Build an index from committed entries in one pass.
    pub(crate) fn rebuild(
        spatial: bool,
        entries: impl IntoIterator<Item = (StoreKey, KeyMeta)>,
    ) -> Self {
        let mut index = Self::new(false);
        let mut points = Vec::new();
        for (key, meta) in entries {
            if let (true, Some(location)) = (spatial, meta.location) {
                points.push(SpatialEntry::new(key.clone(), location));
            }
            index.insert_plain(key, meta);
        }
        if spatial {
            index.spatial = Some(SpatialIndex::bulk_load(points));
        }
        index
    }

    /// Index `key`, replacing any previous entry for it.
    pub(crate) fn insert(&mut self, key: StoreKey, meta: KeyMeta) {
        self.remove(&key);
        if let (Some(spatial), Some(location)) = (self.spatial.as_mut(), meta.location) {
            spatial.insert(key.clone(), location);
        }
        self.insert_plain(key, meta);
    }

    fn insert_plain(&mut self, key: StoreKey, meta: KeyMeta) {
        if let Some(foi) = &meta.foi_id {
            self.fois.entry(foi.clone()).or_default().insert(key.clone());
        }
        self.producers
            .entry(key.producer_id)
            .or_default()
            .insert(key.timestamp, meta);
    }

    /// Drop `key` from every index, returning its metadata.
    pub(crate) fn remove(&mut self, key: &StoreKey) -> Option<KeyMeta> {
        let timeline = self.producers.get_mut(&key.producer_id)?;
        let meta = timeline.remove(&key.timestamp)?;
        if timeline.is_empty() {
            self.producers.remove(&key.producer_id);
        }
        if let Some(foi) = &meta.foi_id
            && let Some(keys) = self.fois.get_mut(foi)
        {
            keys.remove(key);
            if keys.is_empty() {
                self.fois.remove(foi);
            }
        }
        if let (Some(spatial), Some(location)) = (self.spatial.as_mut(), meta.location) {
            spatial.remove(key, location);
        }
        Some(meta)
    }

    pub(crate) const fn producers(&self) -> &BTreeMap<String, ProducerTimeline> {
        &self.producers
    }

    pub(crate) fn timeline(&self, producer: &str) -> Option<&ProducerTimeline> {
        self.producers.get(producer)
    }

    pub(crate) fn meta(&self, key: &StoreKey) -> Option<&KeyMeta> {
        self.producers.get(&key.producer_id)?.get(&key.timestamp)
    }

    pub(crate) fn foi_keys(&self, foi: &str) -> Option<&BTreeSet<StoreKey>> {
        self.fois.get(foi)
    }

    pub(crate) fn foi_ids(&self) -> impl Iterator<Item = &String> {
        self.fois.keys()
    }

    pub(crate) const fn spatial(&self) -> Option<&SpatialIndex> {
        self.spatial.as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.producers.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use rstest::rstest;

    fn key(producer: &str, seconds: f64) -> StoreKey {
        StoreKey::new(producer, Timestamp::new(seconds).expect("not NaN"))
    }

    fn meta(foi: Option<&str>, location: Option<(f64, f64)>) -> KeyMeta {
        KeyMeta {
            foi_id: foi.map(str::to_owned),
            location,
        }
    }

    #[rstest]
    fn replacing_a_key_moves_it_between_fois_and_places() {
        let mut index = StreamIndex::new(true);
        index.insert(key("p", 1.0), meta(Some("a"), Some((1.0, 1.0))));
        index.insert(key("p", 1.0), meta(Some("b"), Some((50.0, 50.0))));

        assert_eq!(index.len(), 1);
        assert!(index.foi_keys("a").is_none());
        assert_eq!(
            index.foi_keys("b").map(|keys| keys.len()),
            Some(1)
        );
        let near_origin = polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 2.0), (x: 0.0, y: 2.0)];
        let spatial = index.spatial().expect("spatial index enabled");
        assert!(spatial.query_region(&near_origin).is_empty());
        assert_eq!(spatial.len(), 1);
    }

    #[rstest]
    fn removing_the_last_key_drops_the_producer() {
        let mut index = StreamIndex::new(false);
        index.insert(key("p", 1.0), meta(None, None));
        assert!(index.remove(&key("p", 1.0)).is_some());
        assert!(index.producers().is_empty());
        assert!(index.remove(&key("p", 1.0)).is_none());
    }

    #[rstest]
    fn rebuild_matches_incremental_inserts() {
        let entries = vec![
            (key("a", 1.0), meta(Some("f"), Some((1.0, 2.0)))),
            (key("b", 2.0), meta(None, Some((3.0, 4.0)))),
            (key("a", 3.0), meta(Some("f"), None)),
        ];
        let rebuilt = StreamIndex::rebuild(true, entries.clone());
        let mut incremental = StreamIndex::new(true);
        for (k, m) in entries {
            incremental.insert(k, m);
        }
        assert_eq!(rebuilt.producers(), incremental.producers());
        assert_eq!(rebuilt.foi_keys("f"), incremental.foi_keys("f"));
        assert_eq!(
            rebuilt.spatial().map(SpatialIndex::len),
            incremental.spatial().map(SpatialIndex::len)
        );
    }
}
