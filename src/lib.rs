//! Facade crate for the observation store.
//!
//! This crate re-exports the store, cache, filter and schema types from
//! `obstore-core`, plus the shared test fixtures behind the `test-support`
//! feature.
//!
//! # Examples
//!
//! ```
//! use obstore::{Filter, ObservationStore, RecordKey, StoreConfig};
//! use obstore::{FieldKind, RecordSchema, TupleWriter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("facade.obs");
//! let store = ObservationStore::open(&StoreConfig::new(path.to_str().ok_or("utf-8")?))?;
//! let schema = RecordSchema::new("x, y", vec![FieldKind::F64, FieldKind::F64])?
//!     .with_location(0, 1)?;
//! let track = store.open_stream("track", schema, true)?;
//! store.append(&track, RecordKey::new("buoy", 0.0), TupleWriter::new().f64(1.0).f64(2.0).finish())?;
//! store.commit()?;
//! assert_eq!(store.query("track", &Filter::new())?.count(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub use obstore_core::{
    AppendOutcome, CacheEntry, CacheStats, CachedRecords, CachedStore, ConfigError, Cursor,
    DEFAULT_BUCKET_SPAN_SECS, DEFAULT_CLUSTER_GAP_SECS, DEFAULT_MEMORY_CACHE_SIZE,
    DEFAULT_PRELOAD_QUOTA, FieldKind, Filter, FilterError, IndexingSkipped, LocationFields,
    ObservationStore, PageStoreError, PayloadError, PreloadConfig, Record, RecordKey,
    RecordSchema, ResultOrdering, SchemaDefinitionError, StoreConfig, StoreError, StoreKey,
    StreamHandle, StreamInfo, TimeRange, Timestamp, TupleReader, TupleWriter, VersionId,
    validate_polygon,
};

/// Shared fixtures for tests of code built on the store.
#[cfg(feature = "test-support")]
pub use obstore_core::test_support;
