//! Error and outcome types shared by the store, filter engine and cache.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::key::RecordKey;
use crate::page::PageStoreError;
use crate::schema::{PayloadError, SchemaDefinitionError};

/// Errors raised by [`crate::ObservationStore`] and [`crate::CachedStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The page file could not be read or written.
    #[error(transparent)]
    StorageIo(#[from] PageStoreError),
    /// A payload or schema did not agree with the stream definition.
    #[error("schema mismatch on stream `{stream}`: {reason}")]
    SchemaMismatch {
        /// Stream being written or opened.
        stream: String,
        /// Human-readable description of the disagreement.
        reason: String,
    },
    /// A filter failed validation.
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),
    /// The requested stream or record does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing item.
        what: String,
    },
    /// A record key cannot be stored.
    #[error("invalid record key for producer `{producer_id}`: {reason}")]
    InvalidKey {
        /// Producer named by the key.
        producer_id: String,
        /// Why the key was refused.
        reason: String,
    },
    /// The configuration cannot be used.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    /// The storage location cannot be written.
    #[error("storage path {path} is not writable: {source}")]
    UnwritablePath {
        /// Configured storage path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn payload(stream: &str, err: &PayloadError) -> Self {
        Self::SchemaMismatch {
            stream: stream.to_owned(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn definition(stream: &str, err: &SchemaDefinitionError) -> Self {
        Self::SchemaMismatch {
            stream: stream.to_owned(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn unknown_stream(stream: &str) -> Self {
        Self::NotFound {
            what: format!("stream `{stream}`"),
        }
    }

    pub(crate) fn nan_timestamp(key: &RecordKey) -> Self {
        Self::InvalidKey {
            producer_id: key.producer_id.clone(),
            reason: String::from("timestamp is NaN"),
        }
    }
}

/// Reasons a [`crate::Filter`] is rejected before any index is consulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// A bound of the time range is NaN.
    #[error("time range bound is NaN")]
    NanTimeBound,
    /// The time range starts after it ends.
    #[error("time range is reversed: start {start} is after end {end}")]
    ReversedTimeRange {
        /// Lower bound as supplied.
        start: String,
        /// Upper bound as supplied.
        end: String,
    },
    /// The region of interest has fewer than three distinct vertices.
    #[error("region of interest needs at least three distinct vertices, found {found}")]
    DegeneratePolygon {
        /// Number of distinct vertices.
        found: usize,
    },
    /// The region of interest has a NaN or infinite coordinate.
    #[error("region of interest has a non-finite coordinate")]
    NonFiniteCoordinate,
    /// Two non-adjacent edges of the region of interest cross.
    #[error("region of interest is self-intersecting")]
    SelfIntersecting,
    /// A cluster gap is negative or NaN.
    #[error("cluster gap must be a non-negative number, got {gap}")]
    InvalidClusterGap {
        /// Gap as supplied.
        gap: String,
    },
    /// The stream has no location fields to test against the region.
    #[error("stream `{stream}` has no location fields; region filters are unsupported")]
    RegionWithoutLocation {
        /// Stream the filter was applied to.
        stream: String,
    },
}

/// Why a stored record was left out of the spatial index.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexingSkipped {
    /// The location fields could not be decoded.
    #[error("location could not be read: {0}")]
    Unreadable(PayloadError),
    /// A coordinate is NaN or infinite.
    #[error("location ({x}, {y}) is not finite")]
    NonFinite {
        /// Extracted x coordinate.
        x: f64,
        /// Extracted y coordinate.
        y: f64,
    },
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The record was buffered and will be fully indexed on commit.
    Indexed,
    /// The record was buffered but will not appear in the spatial index.
    IndexingSkipped(IndexingSkipped),
}

impl AppendOutcome {
    /// Whether the record will be spatially indexed.
    #[must_use]
    pub const fn is_indexed(&self) -> bool {
        matches!(self, Self::Indexed)
    }
}
