//! The observation store: streams of records over a page file.
//!
//! Appends are buffered in a pending batch. [`ObservationStore::commit`]
//! merges the batch into the affected record pages, durably commits the page
//! file and only then publishes the new page table together with the index
//! updates, so readers see either all of a commit or none of it. Superseded
//! record pages are reclaimed by compacting the page file after a commit.

mod query;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};

use crate::config::StoreConfig;
use crate::error::{AppendOutcome, IndexingSkipped, StoreError};
use crate::index::{KeyMeta, StreamIndex};
use crate::key::{RecordKey, StoreKey};
use crate::page::{PageStore, PageTable, VersionId};
use crate::record::{
    Catalog, PageEntry, PageKey, PendingBatch, PendingChange, RecordPage, StreamInfo, page_of,
};
use crate::schema::RecordSchema;
use crate::sync::{lock, read, write};

pub use query::DEFAULT_CLUSTER_GAP_SECS;

/// Handle returned by [`ObservationStore::open_stream`] for appending.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    name: String,
    schema: Arc<RecordSchema>,
    index_locations: bool,
}

impl StreamHandle {
    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema records must follow.
    #[must_use]
    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Whether appended records feed the spatial index.
    #[must_use]
    pub const fn indexes_locations(&self) -> bool {
        self.index_locations
    }
}

struct StreamState {
    info: StreamInfo,
    schema: Arc<RecordSchema>,
    index: StreamIndex,
}

struct Published {
    version: VersionId,
    table: Arc<PageTable<PageKey>>,
    streams: BTreeMap<String, StreamState>,
}

struct IndexDelta {
    stream: String,
    key: StoreKey,
    meta: Option<KeyMeta>,
}

type Changes = BTreeMap<String, BTreeMap<StoreKey, PendingChange>>;

/// Persistent, indexed store of time-stamped observations.
///
/// The store is `Send + Sync`; share it by reference or through an `Arc`.
///
/// # Examples
///
/// ```
/// use obstore_core::{FieldKind, Filter, ObservationStore, RecordKey, RecordSchema, StoreConfig, TupleWriter};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("obs.obs");
/// let config = StoreConfig::new(path.to_str().ok_or("utf-8")?);
/// let store = ObservationStore::open(&config)?;
///
/// let schema = RecordSchema::new("x, y", vec![FieldKind::F64, FieldKind::F64])?.with_location(0, 1)?;
/// let track = store.open_stream("track", schema, true)?;
/// store.append(&track, RecordKey::new("boat", 1.0), TupleWriter::new().f64(3.0).f64(4.0).finish())?;
/// store.commit()?;
///
/// let records: Vec<_> = store.query("track", &Filter::new())?.collect::<Result<_, _>>()?;
/// assert_eq!(records.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct ObservationStore {
    path: Utf8PathBuf,
    bucket_span: f64,
    index_obs_location: bool,
    /// Held for the whole of a commit; doubles as the commit lock.
    pages: Mutex<PageStore<PageKey>>,
    pending: Mutex<PendingBatch>,
    published: RwLock<Published>,
}

impl fmt::Debug for ObservationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationStore")
            .field("path", &self.path)
            .field("bucket_span", &self.bucket_span)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

fn unwritable(path: &Utf8Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::UnwritablePath {
        path: path.to_path_buf(),
        source,
    }
}

fn indexes_locations(info: &StreamInfo, enabled: bool) -> bool {
    enabled && info.index_spatial && info.schema.has_location()
}

/// Location to index for a payload, or why it cannot be indexed.
fn locate(schema: &RecordSchema, payload: &[u8]) -> Result<Option<(f64, f64)>, IndexingSkipped> {
    match schema.location(payload) {
        Ok(Some((x, y))) if x.is_finite() && y.is_finite() => Ok(Some((x, y))),
        Ok(Some((x, y))) => Err(IndexingSkipped::NonFinite { x, y }),
        Ok(None) => Ok(None),
        Err(err) => Err(IndexingSkipped::Unreadable(err)),
    }
}

impl ObservationStore {
    /// Open or create the store described by `config`.
    ///
    /// Fails fast when the storage location cannot be written or the page
    /// file is corrupt. Indices are rebuilt from the committed pages.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let path = config.storage_path.as_path();
        obstore_fs::ensure_parent_dir(path).map_err(unwritable(path))?;
        obstore_fs::check_writable(path).map_err(unwritable(path))?;

        let mut pages: PageStore<PageKey> = PageStore::open(path)?;
        let catalog = match pages.get_value::<Catalog>(&PageKey::Catalog)? {
            Some(catalog) => {
                if catalog.bucket_span.total_cmp(&config.bucket_span_secs).is_ne() {
                    warn!(
                        "{path} was written with {}s buckets; ignoring configured {}s",
                        catalog.bucket_span, config.bucket_span_secs
                    );
                }
                catalog
            }
            None => Catalog::empty(config.bucket_span_secs),
        };
        let streams = Self::rebuild(&pages, &catalog, config.index_obs_location)?;
        let version = pages.version();
        let table = pages.snapshot();
        info!(
            "opened observation store {path} at version {version} with {} streams",
            streams.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            bucket_span: catalog.bucket_span,
            index_obs_location: config.index_obs_location,
            pages: Mutex::new(pages),
            pending: Mutex::new(PendingBatch::default()),
            published: RwLock::new(Published {
                version,
                table,
                streams,
            }),
        })
    }

    fn rebuild(
        pages: &PageStore<PageKey>,
        catalog: &Catalog,
        index_obs_location: bool,
    ) -> Result<BTreeMap<String, StreamState>, StoreError> {
        let table = pages.snapshot();
        let mut reader = pages.reader()?;
        let mut entries: BTreeMap<&str, Vec<(StoreKey, KeyMeta)>> = BTreeMap::new();
        for (page_key, page) in table.iter() {
            let PageKey::Records {
                stream, producer, ..
            } = page_key
            else {
                continue;
            };
            let Some(info) = catalog.streams.get(stream) else {
                warn!("ignoring record page for unknown stream `{stream}`");
                continue;
            };
            let spatial = indexes_locations(info, index_obs_location);
            let decoded: RecordPage = reader.read_value(*page)?;
            let list = entries.entry(stream.as_str()).or_default();
            for (timestamp, entry) in decoded {
                let location = if spatial {
                    locate(&info.schema, &entry.payload).ok().flatten()
                } else {
                    None
                };
                list.push((
                    StoreKey::new(producer.as_str(), timestamp),
                    KeyMeta {
                        foi_id: entry.foi_id,
                        location,
                    },
                ));
            }
        }

        Ok(catalog
            .streams
            .iter()
            .map(|(name, info)| {
                let spatial = indexes_locations(info, index_obs_location);
                let keys = entries.remove(name.as_str()).unwrap_or_default();
                let state = StreamState {
                    info: info.clone(),
                    schema: Arc::new(info.schema.clone()),
                    index: StreamIndex::rebuild(spatial, keys),
                };
                (name.clone(), state)
            })
            .collect())
    }

    /// Location of the page file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Width of a record page's time bucket in seconds.
    #[must_use]
    pub const fn bucket_span(&self) -> f64 {
        self.bucket_span
    }

    /// Version of the last published commit.
    #[must_use]
    pub fn version(&self) -> VersionId {
        read(&self.published).version
    }

    /// Number of buffered record changes awaiting commit.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Create a stream, or reopen it when it already exists with the same
    /// definition.
    ///
    /// New streams are persisted by the next commit.
    pub fn open_stream(
        &self,
        name: &str,
        schema: RecordSchema,
        index_spatial: bool,
    ) -> Result<StreamHandle, StoreError> {
        if name.is_empty() {
            return Err(StoreError::SchemaMismatch {
                stream: String::new(),
                reason: String::from("stream name is empty"),
            });
        }
        schema
            .check()
            .map_err(|err| StoreError::definition(name, &err))?;

        let mut published = write(&self.published);
        if let Some(existing) = published.streams.get(name) {
            if existing.info.schema != schema {
                return Err(StoreError::SchemaMismatch {
                    stream: name.to_owned(),
                    reason: String::from("stream already exists with a different schema"),
                });
            }
            if existing.info.index_spatial != index_spatial {
                return Err(StoreError::SchemaMismatch {
                    stream: name.to_owned(),
                    reason: format!(
                        "stream already exists with spatial indexing {}",
                        if existing.info.index_spatial { "enabled" } else { "disabled" }
                    ),
                });
            }
            return Ok(self.handle(existing));
        }

        let info = StreamInfo {
            name: name.to_owned(),
            schema,
            index_spatial,
        };
        let state = StreamState {
            index: StreamIndex::new(indexes_locations(&info, self.index_obs_location)),
            schema: Arc::new(info.schema.clone()),
            info,
        };
        let handle = self.handle(&state);
        published.streams.insert(name.to_owned(), state);
        lock(&self.pending).mark_catalog_dirty();
        info!("created stream `{name}`");
        Ok(handle)
    }

    /// Handle for an existing stream.
    pub fn stream(&self, name: &str) -> Result<StreamHandle, StoreError> {
        let published = read(&self.published);
        published
            .streams
            .get(name)
            .map(|state| self.handle(state))
            .ok_or_else(|| StoreError::unknown_stream(name))
    }

    fn handle(&self, state: &StreamState) -> StreamHandle {
        StreamHandle {
            name: state.info.name.clone(),
            schema: Arc::clone(&state.schema),
            index_locations: indexes_locations(&state.info, self.index_obs_location),
        }
    }

    /// Names of every stream, sorted.
    #[must_use]
    pub fn streams(&self) -> Vec<String> {
        read(&self.published).streams.keys().cloned().collect()
    }

    /// Schema of stream `name`.
    pub fn stream_schema(&self, name: &str) -> Result<RecordSchema, StoreError> {
        self.stream(name).map(|handle| handle.schema().clone())
    }

    /// Buffer a record for the next commit.
    ///
    /// A record with the same `(producer, timestamp)` as a buffered or
    /// committed one replaces it. Records whose location cannot be indexed
    /// are still stored; the outcome says so.
    pub fn append(
        &self,
        stream: &StreamHandle,
        key: RecordKey,
        payload: Vec<u8>,
    ) -> Result<AppendOutcome, StoreError> {
        let (store_key, outcome, location) = Self::prepare(stream, &key, &payload)?;
        lock(&self.pending).record(
            stream.name(),
            store_key,
            PendingChange::Upsert {
                foi_id: key.foi_id,
                payload,
                location,
            },
        );
        Ok(outcome)
    }

    /// Validate a record for `stream` and work out its index location.
    pub(crate) fn prepare(
        stream: &StreamHandle,
        key: &RecordKey,
        payload: &[u8],
    ) -> Result<(StoreKey, AppendOutcome, Option<(f64, f64)>), StoreError> {
        if key.producer_id.is_empty() {
            return Err(StoreError::InvalidKey {
                producer_id: String::new(),
                reason: String::from("producer id is empty"),
            });
        }
        let store_key = key
            .store_key()
            .ok_or_else(|| StoreError::nan_timestamp(key))?;
        stream
            .schema
            .validate(payload)
            .map_err(|err| StoreError::payload(stream.name(), &err))?;
        if !stream.index_locations {
            return Ok((store_key, AppendOutcome::Indexed, None));
        }
        match locate(&stream.schema, payload) {
            Ok(location) => Ok((store_key, AppendOutcome::Indexed, location)),
            Err(skipped) => {
                warn!(
                    "record ({}, {}) in stream `{}` is stored without a spatial index entry: {skipped}",
                    store_key.producer_id,
                    store_key.timestamp,
                    stream.name()
                );
                Ok((store_key, AppendOutcome::IndexingSkipped(skipped), None))
            }
        }
    }

    /// Buffer the removal of a record.
    pub fn remove(&self, stream: &str, key: &RecordKey) -> Result<(), StoreError> {
        self.stream(stream)?;
        let store_key = key
            .store_key()
            .ok_or_else(|| StoreError::nan_timestamp(key))?;
        lock(&self.pending).record(stream, store_key, PendingChange::Remove);
        Ok(())
    }

    /// Drop every buffered record change.
    ///
    /// Streams created since the last commit stay registered and are
    /// persisted by the next commit. Returns the number of discarded changes.
    pub fn rollback(&self) -> usize {
        let mut pending = lock(&self.pending);
        let discarded = pending.len();
        let catalog_dirty = pending.catalog_dirty();
        *pending = PendingBatch::default();
        if catalog_dirty {
            pending.mark_catalog_dirty();
        }
        discarded
    }

    /// Durably persist every buffered change and publish it to readers.
    ///
    /// Appends made while a commit runs land in the next one. When writing
    /// fails, the page file is rolled back and the changes are returned to
    /// the pending batch so the commit can be retried.
    pub fn commit(&self) -> Result<VersionId, StoreError> {
        let mut pages = lock(&self.pages);
        let batch = std::mem::take(&mut *lock(&self.pending));
        if batch.is_empty() {
            return Ok(pages.version());
        }
        let catalog_dirty = batch.catalog_dirty();
        let change_count = batch.len();
        let changes = batch.into_streams();

        let deltas = match self.write_changes(&mut pages, &changes, catalog_dirty) {
            Ok(deltas) => deltas,
            Err(err) => {
                if let Err(rollback) = pages.rollback_to_last_commit() {
                    warn!("rolling back {} after a failed commit failed: {rollback}", self.path);
                }
                lock(&self.pending).restore_older(changes, catalog_dirty);
                return Err(err);
            }
        };

        let version = pages.version();
        let mut published = write(&self.published);
        published.version = version;
        published.table = pages.snapshot();
        for delta in deltas {
            let Some(stream) = published.streams.get_mut(&delta.stream) else {
                continue;
            };
            match delta.meta {
                Some(meta) => stream.index.insert(delta.key, meta),
                None => {
                    stream.index.remove(&delta.key);
                }
            }
        }
        drop(published);
        info!("committed version {version} of {} ({change_count} record changes)", self.path);
        self.compact_if_needed(&mut pages);
        Ok(version)
    }

    /// Rewrite the page file without superseded pages once they outweigh the
    /// live ones. The new table is published together with the file swap.
    /// A failed compaction leaves the committed file in use.
    fn compact_if_needed(&self, pages: &mut PageStore<PageKey>) {
        if !pages.needs_compaction() {
            return;
        }
        let compaction = match pages.write_compacted() {
            Ok(compaction) => compaction,
            Err(err) => {
                warn!("compacting {} failed: {err}", self.path);
                return;
            }
        };
        let mut published = write(&self.published);
        match pages.install(compaction) {
            Ok(()) => published.table = pages.snapshot(),
            Err(err) => warn!("compacting {} failed: {err}", self.path),
        }
    }

    fn write_changes(
        &self,
        pages: &mut PageStore<PageKey>,
        changes: &Changes,
        catalog_dirty: bool,
    ) -> Result<Vec<IndexDelta>, StoreError> {
        let (table, catalog) = {
            let published = read(&self.published);
            let catalog = Catalog {
                bucket_span: self.bucket_span,
                streams: published
                    .streams
                    .iter()
                    .map(|(name, state)| (name.clone(), state.info.clone()))
                    .collect(),
            };
            (Arc::clone(&published.table), catalog)
        };

        let mut grouped: BTreeMap<PageKey, Vec<(&str, &StoreKey, &PendingChange)>> =
            BTreeMap::new();
        for (stream, keys) in changes {
            for (key, change) in keys {
                grouped
                    .entry(page_of(stream, key, self.bucket_span))
                    .or_default()
                    .push((stream.as_str(), key, change));
            }
        }

        let mut reader = pages.reader()?;
        let mut deltas = Vec::new();
        for (page_key, entries) in grouped {
            let mut page: RecordPage = match table.get(&page_key) {
                Some(existing) => reader.read_value(*existing)?,
                None => RecordPage::new(),
            };
            for (stream, key, change) in entries {
                let meta = match change {
                    PendingChange::Upsert {
                        foi_id,
                        payload,
                        location,
                    } => {
                        page.insert(
                            key.timestamp,
                            PageEntry {
                                foi_id: foi_id.clone(),
                                payload: payload.clone(),
                            },
                        );
                        Some(KeyMeta {
                            foi_id: foi_id.clone(),
                            location: *location,
                        })
                    }
                    PendingChange::Remove => {
                        if page.remove(&key.timestamp).is_none() {
                            continue;
                        }
                        None
                    }
                };
                deltas.push(IndexDelta {
                    stream: stream.to_owned(),
                    key: key.clone(),
                    meta,
                });
            }
            if page.is_empty() {
                pages.remove(page_key);
            } else {
                pages.put_value(page_key, &page)?;
            }
        }
        if catalog_dirty {
            pages.put_value(PageKey::Catalog, &catalog)?;
        }
        pages.commit()?;
        Ok(deltas)
    }
}
