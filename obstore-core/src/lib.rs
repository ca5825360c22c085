//! Persistent store for time-stamped observation records.
//!
//! Records are grouped into named streams. Each stream has a fixed
//! [`RecordSchema`] describing its binary payloads and, optionally, which
//! fields hold a planar location. An [`ObservationStore`] keeps the records
//! in a single crash-safe page file and maintains time, producer, feature of
//! interest and spatial indices in memory. A [`CachedStore`] puts a bounded
//! write-back cache with preloading in front of it.
//!
//! Writes are buffered and become durable and visible together on commit.
//! Queries are expressed as a [`Filter`] and return a lazy [`Cursor`].

#![cfg_attr(docsrs, feature(doc_cfg))]

mod cache;
mod config;
mod error;
mod filter;
mod index;
mod key;
pub mod page;
mod record;
mod schema;
mod store;
mod sync;

#[cfg(any(test, feature = "test-support"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-support")))]
pub mod test_support;

pub use cache::{CacheEntry, CacheStats, CachedRecords, CachedStore};
pub use config::{
    ConfigError, DEFAULT_MEMORY_CACHE_SIZE, DEFAULT_PRELOAD_QUOTA, PreloadConfig, StoreConfig,
};
pub use error::{AppendOutcome, FilterError, IndexingSkipped, StoreError};
pub use filter::{Cursor, Filter, ResultOrdering, TimeRange, validate_polygon};
pub use key::{Record, RecordKey, StoreKey, Timestamp};
pub use page::{PageStoreError, VersionId};
pub use record::{DEFAULT_BUCKET_SPAN_SECS, StreamInfo};
pub use schema::{
    FieldKind, LocationFields, PayloadError, RecordSchema, SchemaDefinitionError, TupleReader,
    TupleWriter,
};
pub use store::{DEFAULT_CLUSTER_GAP_SECS, ObservationStore, StreamHandle};
