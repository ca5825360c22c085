//! Record pages, the stream catalogue and the pending write batch.
//!
//! Records of one stream are partitioned into pages keyed by
//! `(stream, producer, bucket)`, where the bucket is the timestamp divided by
//! the bucket span and rounded down. Inside a page entries are ordered by
//! timestamp, so a scan over consecutive buckets yields records in
//! `(producer, timestamp)` order.

mod batch;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key::{Record, RecordKey, StoreKey, Timestamp};
use crate::schema::RecordSchema;

pub(crate) use batch::{PendingBatch, PendingChange};

/// Default width of a time bucket in seconds.
pub const DEFAULT_BUCKET_SPAN_SECS: f64 = 3600.0;

/// Key of one page in the page store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub(crate) enum PageKey {
    /// Stream definitions and store-wide settings.
    Catalog,
    /// Records of one producer within one time bucket.
    Records {
        stream: String,
        producer: String,
        bucket: i64,
    },
}

impl PageKey {
    pub(crate) fn records(stream: &str, producer: &str, bucket: i64) -> Self {
        Self::Records {
            stream: stream.to_owned(),
            producer: producer.to_owned(),
            bucket,
        }
    }
}

/// Map a timestamp to its bucket.
///
/// Infinite timestamps saturate to the outermost buckets.
#[must_use]
pub(crate) fn bucket_of(timestamp: Timestamp, span: f64) -> i64 {
    // `as` saturates on overflow and infinities.
    (timestamp.seconds() / span).floor() as i64
}

/// One stored entry inside a record page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PageEntry {
    pub(crate) foi_id: Option<String>,
    pub(crate) payload: Vec<u8>,
}

impl PageEntry {
    pub(crate) fn into_record(self, producer: &str, timestamp: Timestamp) -> Record {
        let key = RecordKey {
            producer_id: producer.to_owned(),
            foi_id: self.foi_id,
            timestamp: timestamp.seconds(),
        };
        Record::new(key, self.payload)
    }
}

/// Decoded contents of one record page.
pub(crate) type RecordPage = BTreeMap<Timestamp, PageEntry>;

/// Definition of a stream as persisted in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream name.
    pub name: String,
    /// Schema fixed at creation.
    pub schema: RecordSchema,
    /// Whether record locations feed the spatial index.
    pub index_spatial: bool,
}

/// Catalogue page: every stream plus the bucket span the pages were cut with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Catalog {
    pub(crate) bucket_span: f64,
    pub(crate) streams: BTreeMap<String, StreamInfo>,
}

impl Catalog {
    pub(crate) const fn empty(bucket_span: f64) -> Self {
        Self {
            bucket_span,
            streams: BTreeMap::new(),
        }
    }
}

/// Page a stored key lives in.
pub(crate) fn page_of(stream: &str, key: &StoreKey, span: f64) -> PageKey {
    PageKey::records(stream, &key.producer_id, bucket_of(key.timestamp, span))
}
