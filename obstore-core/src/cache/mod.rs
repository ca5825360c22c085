//! In-memory write-back cache in front of an [`ObservationStore`].
//!
//! Entries live either in a bounded LRU list or, once preloaded, in a pinned
//! set with its own quota. Writes land in the cache as dirty entries and reach
//! the store on [`CachedStore::commit`] or when eviction pushes them out. An
//! eviction flush commits the store, including anything else appended to it
//! directly and not yet committed.
//!
//! A preload remembers the filter it pinned together with the store version
//! it read. While that window is complete and the store has not committed
//! since, queries it covers are answered from memory alone.

mod records;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Mutex;

use log::{info, warn};
use lru::LruCache;

use crate::config::StoreConfig;
use crate::error::{AppendOutcome, StoreError};
use crate::filter::Filter;
use crate::key::{Record, RecordKey, StoreKey};
use crate::page::VersionId;
use crate::schema::RecordSchema;
use crate::store::{ObservationStore, StreamHandle};
use crate::sync::lock;

pub use records::CachedRecords;

/// Records read from the store are added to the cache in groups this size.
const POPULATE_BATCH: usize = 256;

/// Preload windows remembered for cache-only answers.
const MAX_WINDOWS: usize = 16;

type CacheKey = (String, StoreKey);

/// One resident record.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    record: Record,
    location: Option<(f64, f64)>,
    dirty: bool,
    pinned: bool,
}

impl CacheEntry {
    fn new(schema: &RecordSchema, record: Record, dirty: bool) -> Self {
        let location = schema.location(&record.payload).ok().flatten();
        Self {
            record,
            location,
            dirty,
            pinned: false,
        }
    }

    /// Cached record.
    #[must_use]
    pub const fn record(&self) -> &Record {
        &self.record
    }

    /// Whether the record has not reached the store yet.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the record is held by a preload.
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        self.pinned
    }

    fn admitted_by(&self, filter: &Filter) -> bool {
        filter.admits(&self.record.key, self.location)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from memory.
    pub hits: u64,
    /// Lookups that went to the store.
    pub misses: u64,
    /// Entries pushed out of the LRU list.
    pub evictions: u64,
    /// Dirty entries appended to the store because they were evicted.
    pub out_of_band_flushes: u64,
    /// Unpinned resident entries.
    pub resident: usize,
    /// Pinned entries.
    pub pinned: usize,
}

#[derive(Debug)]
struct PreloadWindow {
    stream: String,
    filter: Filter,
    version: VersionId,
    complete: bool,
}

struct CacheState {
    /// Unpinned entries; bounded by hand so dirty victims can be flushed.
    lru: LruCache<CacheKey, CacheEntry>,
    pinned: BTreeMap<CacheKey, CacheEntry>,
    pin_order: VecDeque<CacheKey>,
    windows: VecDeque<PreloadWindow>,
    stats: CacheStats,
}

impl CacheState {
    fn new() -> Self {
        Self {
            lru: LruCache::unbounded(),
            pinned: BTreeMap::new(),
            pin_order: VecDeque::new(),
            windows: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    fn lookup(&mut self, key: &CacheKey) -> Option<&CacheEntry> {
        if let Some(entry) = self.pinned.get(key) {
            return Some(entry);
        }
        self.lru.get(key)
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.pinned.contains_key(key) || self.lru.contains(key)
    }

    /// Store `entry`, keeping it pinned when its key already is.
    fn upsert(&mut self, key: CacheKey, mut entry: CacheEntry) {
        if let Some(pinned) = self.pinned.get_mut(&key) {
            entry.pinned = true;
            *pinned = entry;
        } else {
            self.lru.put(key, entry);
        }
    }

    fn pin(&mut self, key: CacheKey, mut entry: CacheEntry) {
        entry.pinned = true;
        if self.pinned.insert(key.clone(), entry).is_none() {
            self.pin_order.push_back(key);
        }
    }

    /// Demote the oldest pins until at most `quota` remain.
    fn enforce_quota(&mut self, quota: usize) {
        while self.pinned.len() > quota {
            let Some(key) = self.pin_order.pop_front() else {
                break;
            };
            if let Some(mut entry) = self.pinned.remove(&key) {
                entry.pinned = false;
                self.lru.put(key, entry);
            }
        }
    }

    /// Evict least recently used entries beyond `capacity`. Dirty victims
    /// are appended to the store and committed before this returns, so they
    /// stay readable once they leave memory.
    fn enforce_capacity(
        &mut self,
        capacity: usize,
        store: &ObservationStore,
    ) -> Result<(), StoreError> {
        let mut flushed = 0_u64;
        while self.lru.len() > capacity {
            let Some(((stream, _), entry)) = self.lru.peek_lru() else {
                break;
            };
            if entry.dirty {
                let handle = store.stream(stream)?;
                store.append(&handle, entry.record.key.clone(), entry.record.payload.clone())?;
                warn!(
                    "evicted unsaved record ({}, {}) of stream `{stream}`; flushing it to the store",
                    entry.record.key.producer_id, entry.record.key.timestamp
                );
                flushed += 1;
            }
            let Some(((stream, _), entry)) = self.lru.pop_lru() else {
                break;
            };
            self.stats.evictions += 1;
            for window in &mut self.windows {
                if window.complete && window.stream == stream && entry.admitted_by(&window.filter) {
                    window.complete = false;
                }
            }
        }
        if flushed > 0 {
            store.commit()?;
            self.stats.out_of_band_flushes += flushed;
        }
        Ok(())
    }

    /// Entries of `stream` matching `filter`, plus every cached key of the
    /// stream.
    fn matching(&self, stream: &str, filter: &Filter) -> (Vec<Record>, BTreeSet<StoreKey>) {
        let mut records = Vec::new();
        let mut keys = BTreeSet::new();
        let entries = self
            .pinned
            .iter()
            .chain(self.lru.iter())
            .filter(|((name, _), _)| name == stream);
        for ((_, key), entry) in entries {
            keys.insert(key.clone());
            if entry.admitted_by(filter) {
                records.push(entry.record.clone());
            }
        }
        (records, keys)
    }

    fn covers(&self, stream: &str, filter: &Filter, version: VersionId) -> bool {
        self.windows.iter().any(|window| {
            window.complete
                && window.version == version
                && window.stream == stream
                && filter.is_within(&window.filter)
        })
    }
}

/// Observation store with an in-memory write-back cache.
///
/// # Examples
///
/// ```
/// use obstore_core::{CachedStore, FieldKind, Record, RecordKey, RecordSchema, StoreConfig, TupleWriter};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("cached.obs");
/// let cache = CachedStore::open(&StoreConfig::new(path.to_str().ok_or("utf-8")?))?;
/// let schema = RecordSchema::new("level", vec![FieldKind::F32])?;
/// cache.store().open_stream("tide", schema, false)?;
///
/// let record = Record::new(RecordKey::new("gauge", 0.0), TupleWriter::new().f32(1.5).finish());
/// cache.store_record("tide", record.clone())?;
/// assert_eq!(cache.get_record("tide", &record.key)?, record);
/// cache.commit()?;
/// assert_eq!(cache.store().record_count("tide")?, 1);
/// # Ok(())
/// # }
/// ```
pub struct CachedStore {
    store: ObservationStore,
    capacity: usize,
    preload_quota: usize,
    state: Mutex<CacheState>,
}

impl fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStore")
            .field("store", &self.store)
            .field("capacity", &self.capacity)
            .field("preload_quota", &self.preload_quota)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CachedStore {
    /// Open the store described by `config` and run its configured preload.
    ///
    /// A preload naming a stream that does not exist yet is skipped with a
    /// warning.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let cache = Self::new(ObservationStore::open(config)?, config)?;
        if let Some(preload) = &config.preload {
            match cache.preload(&preload.stream, &preload.filter) {
                Ok(pinned) => info!("preloaded {pinned} records from `{}`", preload.stream),
                Err(StoreError::NotFound { what }) => {
                    warn!("skipping preload: {what} not found");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(cache)
    }

    /// Wrap an open store using the cache bounds from `config`.
    pub fn new(store: ObservationStore, config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            store,
            capacity: config.memory_cache_size,
            preload_quota: config.preload_quota,
            state: Mutex::new(CacheState::new()),
        })
    }

    /// Underlying store.
    #[must_use]
    pub const fn store(&self) -> &ObservationStore {
        &self.store
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            resident: state.lru.len(),
            pinned: state.pinned.len(),
            ..state.stats
        }
    }

    /// Resident entry for a key, without touching recency or counters.
    pub fn entry(&self, stream: &str, key: &RecordKey) -> Result<Option<CacheEntry>, StoreError> {
        let key = cache_key(stream, key)?;
        let state = lock(&self.state);
        Ok(state
            .pinned
            .get(&key)
            .or_else(|| state.lru.peek(&key))
            .cloned())
    }

    /// Validate `record` and hold it in memory until the next commit.
    pub fn store_record(&self, stream: &str, record: Record) -> Result<AppendOutcome, StoreError> {
        let handle = self.store.stream(stream)?;
        let (key, outcome, _) = ObservationStore::prepare(&handle, &record.key, &record.payload)?;
        let entry = CacheEntry::new(handle.schema(), record, true);
        let mut state = lock(&self.state);
        state.upsert((stream.to_owned(), key), entry);
        state.enforce_capacity(self.capacity, &self.store)?;
        Ok(outcome)
    }

    /// Fetch one record, from memory when resident.
    pub fn get_record(&self, stream: &str, key: &RecordKey) -> Result<Record, StoreError> {
        let cache_key = cache_key(stream, key)?;
        {
            let mut state = lock(&self.state);
            if let Some(record) = state.lookup(&cache_key).map(|entry| entry.record.clone()) {
                state.stats.hits += 1;
                return Ok(record);
            }
            state.stats.misses += 1;
        }
        let handle = self.store.stream(stream)?;
        let record = self.store.get(stream, key)?;
        self.populate(&handle, vec![(cache_key.1, record.clone())])?;
        Ok(record)
    }

    /// Records of `stream` matching `filter`, cached entries taking
    /// precedence over committed ones with the same key.
    pub fn get_records(&self, stream: &str, filter: &Filter) -> Result<CachedRecords<'_>, StoreError> {
        self.store.check_filter(stream, filter)?;
        let handle = self.store.stream(stream)?;
        let version = self.store.version();
        // "Latest" is picked per producer first; the region applies after.
        let unbounded;
        let selection = if filter.is_latest() {
            unbounded = Filter {
                roi: None,
                ..filter.clone()
            };
            &unbounded
        } else {
            filter
        };
        let (mut cached, keys, covered) = {
            let mut state = lock(&self.state);
            let (cached, keys) = state.matching(stream, selection);
            let covered = state.covers(stream, filter, version);
            if covered {
                state.stats.hits += 1;
            } else {
                state.stats.misses += 1;
            }
            (cached, keys, covered)
        };

        if filter.is_latest() {
            let committed: Vec<Record> = if covered {
                Vec::new()
            } else {
                self.store.query(stream, selection)?.collect::<Result<_, _>>()?
            };
            let mut latest = latest_per_producer(cached, committed, &keys);
            if filter.roi.is_some() {
                latest.retain(|record| {
                    let location = handle.schema().location(&record.payload).ok().flatten();
                    filter.admits(&record.key, location)
                });
            }
            latest.sort_by(|a, b| filter.ordering.compare(&a.key, &b.key));
            return Ok(CachedRecords::eager(latest, filter.ordering));
        }

        cached.sort_by(|a, b| filter.ordering.compare(&a.key, &b.key));
        if covered {
            return Ok(CachedRecords::eager(cached, filter.ordering));
        }
        let cursor = self.store.query(stream, filter)?;
        Ok(CachedRecords::merged(self, handle, cached, keys, cursor, filter.ordering))
    }

    /// Pin every record matching `filter`, returning how many are pinned.
    ///
    /// Beyond the preload quota the oldest pins are demoted to ordinary
    /// entries.
    pub fn preload(&self, stream: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.store.check_filter(stream, filter)?;
        let handle = self.store.stream(stream)?;
        let version = self.store.version();
        let committed: Vec<Record> = self.store.query(stream, filter)?.collect::<Result<_, _>>()?;

        let mut state = lock(&self.state);
        let mut matched = BTreeSet::new();
        for record in committed {
            let Some(key) = record.key.store_key() else {
                continue;
            };
            let cache_key = (stream.to_owned(), key);
            if state.pinned.contains_key(&cache_key) {
                matched.insert(cache_key.1);
                continue;
            }
            let entry = state
                .lru
                .pop(&cache_key)
                .unwrap_or_else(|| CacheEntry::new(handle.schema(), record, false));
            matched.insert(cache_key.1.clone());
            state.pin(cache_key, entry);
        }
        if !filter.is_latest() {
            let extra: Vec<CacheKey> = state
                .lru
                .iter()
                .filter(|((name, _), entry)| name == stream && entry.admitted_by(filter))
                .map(|(key, _)| key.clone())
                .collect();
            for key in extra {
                if let Some(entry) = state.lru.pop(&key) {
                    matched.insert(key.1.clone());
                    state.pin(key, entry);
                }
            }
        }

        if state.windows.len() == MAX_WINDOWS {
            state.windows.pop_front();
        }
        state.windows.push_back(PreloadWindow {
            stream: stream.to_owned(),
            filter: filter.clone(),
            version,
            complete: !filter.is_latest(),
        });
        state.enforce_quota(self.preload_quota);
        state.enforce_capacity(self.capacity, &self.store)?;
        Ok(matched.len())
    }

    /// Append every dirty entry to the store and commit it.
    pub fn commit(&self) -> Result<VersionId, StoreError> {
        {
            let mut state = lock(&self.state);
            let mut handles: BTreeMap<String, StreamHandle> = BTreeMap::new();
            let CacheState { lru, pinned, .. } = &mut *state;
            let dirty = pinned
                .iter_mut()
                .chain(lru.iter_mut())
                .filter(|(_, entry)| entry.dirty);
            for ((stream, _), entry) in dirty {
                let handle = match handles.entry(stream.clone()) {
                    Entry::Occupied(slot) => slot.into_mut(),
                    Entry::Vacant(slot) => slot.insert(self.store.stream(stream)?),
                };
                self.store
                    .append(handle, entry.record.key.clone(), entry.record.payload.clone())?;
                entry.dirty = false;
            }
        }
        self.store.commit()
    }

    /// Add clean records read from the store, keeping resident entries.
    fn populate(
        &self,
        handle: &StreamHandle,
        records: Vec<(StoreKey, Record)>,
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        for (key, record) in records {
            let cache_key = (handle.name().to_owned(), key);
            if !state.contains(&cache_key) {
                state
                    .lru
                    .put(cache_key, CacheEntry::new(handle.schema(), record, false));
            }
        }
        state.enforce_capacity(self.capacity, &self.store)
    }
}

fn cache_key(stream: &str, key: &RecordKey) -> Result<CacheKey, StoreError> {
    let store_key = key
        .store_key()
        .ok_or_else(|| StoreError::nan_timestamp(key))?;
    Ok((stream.to_owned(), store_key))
}

/// Newest record per producer across both sources; cached records win ties
/// and shadow committed records with the same key.
fn latest_per_producer(
    cached: Vec<Record>,
    committed: Vec<Record>,
    cached_keys: &BTreeSet<StoreKey>,
) -> Vec<Record> {
    let mut latest: BTreeMap<String, Record> = BTreeMap::new();
    let mut offer = |record: Record| match latest.get(&record.key.producer_id) {
        Some(best) if best.key.timestamp >= record.key.timestamp => {}
        _ => {
            latest.insert(record.key.producer_id.clone(), record);
        }
    };
    cached.into_iter().for_each(&mut offer);
    committed
        .into_iter()
        .filter(|record| {
            record
                .key
                .store_key()
                .is_some_and(|key| !cached_keys.contains(&key))
        })
        .for_each(&mut offer);
    latest.into_values().collect()
}
