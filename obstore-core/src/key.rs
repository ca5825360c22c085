//! Record identifiers and the ordering used for storage locality.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Observation time in seconds with a total order.
///
/// Ordering uses [`f64::total_cmp`], so `-0.0` sorts before `0.0` and the
/// store never has to reason about partial comparisons. NaN is rejected
/// before a value reaches any index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Smallest representable timestamp.
    pub const MIN: Self = Self(f64::NEG_INFINITY);
    /// Largest representable timestamp.
    pub const MAX: Self = Self(f64::INFINITY);

    /// Wrap a raw timestamp, returning `None` for NaN.
    #[must_use]
    pub fn new(seconds: f64) -> Option<Self> {
        if seconds.is_nan() {
            None
        } else {
            Some(Self(seconds))
        }
    }

    /// Seconds since the epoch used by the producer.
    #[must_use]
    pub const fn seconds(self) -> f64 {
        self.0
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage key of a record inside one stream: `(producer, timestamp)`.
///
/// This is the sort key of the record store. The feature of interest is
/// metadata attached to the key and does not participate in ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    /// Producer that emitted the record.
    pub producer_id: String,
    /// Observation time.
    pub timestamp: Timestamp,
}

impl StoreKey {
    /// Build a storage key.
    #[must_use]
    pub fn new(producer_id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            producer_id: producer_id.into(),
            timestamp,
        }
    }
}

/// Identifies one observation within a stream.
///
/// Keys compare by producer, then timestamp under the same total order as
/// [`Timestamp`], then feature of interest.
///
/// # Examples
///
/// ```
/// use obstore_core::RecordKey;
///
/// let key = RecordKey::new("weather-station-1", 12.5).with_foi("site-a");
/// assert_eq!(key.foi_id.as_deref(), Some("site-a"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordKey {
    /// Producer that emitted the record.
    pub producer_id: String,
    /// Feature of interest the observation is about, if known.
    pub foi_id: Option<String>,
    /// Observation time in seconds.
    pub timestamp: f64,
}

impl RecordKey {
    /// Build a key without a feature of interest.
    #[must_use]
    pub fn new(producer_id: impl Into<String>, timestamp: f64) -> Self {
        Self {
            producer_id: producer_id.into(),
            foi_id: None,
            timestamp,
        }
    }

    /// Attach a feature-of-interest identifier.
    #[must_use]
    pub fn with_foi(mut self, foi_id: impl Into<String>) -> Self {
        self.foi_id = Some(foi_id.into());
        self
    }

    /// Storage key, or `None` when the timestamp is NaN.
    #[must_use]
    pub fn store_key(&self) -> Option<StoreKey> {
        Timestamp::new(self.timestamp).map(|ts| StoreKey::new(self.producer_id.clone(), ts))
    }
}

impl PartialEq for RecordKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RecordKey {}

impl PartialOrd for RecordKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.producer_id
            .cmp(&other.producer_id)
            .then_with(|| self.timestamp.total_cmp(&other.timestamp))
            .then_with(|| self.foi_id.cmp(&other.foi_id))
    }
}

impl From<(StoreKey, Option<String>)> for RecordKey {
    fn from((key, foi_id): (StoreKey, Option<String>)) -> Self {
        Self {
            producer_id: key.producer_id,
            foi_id,
            timestamp: key.timestamp.seconds(),
        }
    }
}

/// A stored observation: key plus encoded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity.
    pub key: RecordKey,
    /// Tuple encoded according to the stream schema.
    pub payload: Vec<u8>,
}

impl Record {
    /// Pair a key with its payload.
    #[must_use]
    pub const fn new(key: RecordKey, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }
}
