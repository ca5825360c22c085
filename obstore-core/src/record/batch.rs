//! Buffered writes awaiting the next commit.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::key::StoreKey;

/// Location the spatial index should hold for a record.
pub(crate) type Location = (f64, f64);

/// A buffered change to one key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingChange {
    Upsert {
        foi_id: Option<String>,
        payload: Vec<u8>,
        /// Present only when the record will be spatially indexed.
        location: Option<Location>,
    },
    Remove,
}

/// Writes collected between commits, grouped by stream.
///
/// Later changes to the same `(producer, timestamp)` replace earlier ones.
#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    streams: BTreeMap<String, BTreeMap<StoreKey, PendingChange>>,
    catalog_dirty: bool,
}

impl PendingBatch {
    pub(crate) fn record(&mut self, stream: &str, key: StoreKey, change: PendingChange) {
        self.streams
            .entry(stream.to_owned())
            .or_default()
            .insert(key, change);
    }

    pub(crate) fn mark_catalog_dirty(&mut self) {
        self.catalog_dirty = true;
    }

    pub(crate) const fn catalog_dirty(&self) -> bool {
        self.catalog_dirty
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.catalog_dirty && self.streams.values().all(BTreeMap::is_empty)
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.values().map(BTreeMap::len).sum()
    }

    pub(crate) fn stream(&self, stream: &str) -> Option<&BTreeMap<StoreKey, PendingChange>> {
        self.streams.get(stream)
    }

    pub(crate) fn into_streams(self) -> BTreeMap<String, BTreeMap<StoreKey, PendingChange>> {
        self.streams
    }

    /// Put an older batch back underneath this one after a failed commit.
    ///
    /// Changes already present here were made after `older` was taken and
    /// win over it.
    pub(crate) fn restore_older(&mut self, older: BTreeMap<String, BTreeMap<StoreKey, PendingChange>>, catalog_dirty: bool) {
        self.catalog_dirty |= catalog_dirty;
        for (stream, changes) in older {
            let current = self.streams.entry(stream).or_default();
            for (key, change) in changes {
                if let Entry::Vacant(slot) = current.entry(key) {
                    slot.insert(change);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Timestamp;
    use rstest::rstest;

    fn key(producer: &str, seconds: f64) -> StoreKey {
        StoreKey::new(producer, Timestamp::new(seconds).expect("not NaN"))
    }

    fn upsert(byte: u8) -> PendingChange {
        PendingChange::Upsert {
            foi_id: None,
            payload: vec![byte],
            location: None,
        }
    }

    #[rstest]
    fn later_change_to_the_same_key_wins() {
        let mut batch = PendingBatch::default();
        batch.record("s", key("p", 1.0), upsert(1));
        batch.record("s", key("p", 1.0), upsert(2));
        assert_eq!(batch.len(), 1);
        let changes = batch.stream("s").expect("stream has changes");
        assert_eq!(changes.get(&key("p", 1.0)), Some(&upsert(2)));
    }

    #[rstest]
    fn restored_changes_yield_to_newer_ones() {
        let mut older = PendingBatch::default();
        older.record("s", key("p", 1.0), upsert(1));
        older.record("s", key("p", 2.0), upsert(1));

        let mut newer = PendingBatch::default();
        newer.record("s", key("p", 1.0), PendingChange::Remove);
        newer.restore_older(older.into_streams(), true);

        let changes = newer.stream("s").expect("stream has changes");
        assert_eq!(changes.get(&key("p", 1.0)), Some(&PendingChange::Remove));
        assert_eq!(changes.get(&key("p", 2.0)), Some(&upsert(1)));
        assert!(newer.catalog_dirty());
    }

    #[rstest]
    fn empty_batch_reports_empty() {
        let mut batch = PendingBatch::default();
        assert!(batch.is_empty());
        batch.mark_catalog_dirty();
        assert!(!batch.is_empty());
    }
}
