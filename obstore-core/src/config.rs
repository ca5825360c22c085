//! Explicit configuration for [`crate::ObservationStore`] and
//! [`crate::CachedStore`].
//!
//! Configuration is always passed to constructors; nothing is read from
//! global state. Every field except the storage path has a default, so a
//! JSON document only needs to name the page file.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FilterError;
use crate::filter::Filter;
use crate::record::DEFAULT_BUCKET_SPAN_SECS;

/// Default bound on resident unpinned cache entries.
pub const DEFAULT_MEMORY_CACHE_SIZE: usize = 10_000;

/// Default number of entries a preload may pin.
pub const DEFAULT_PRELOAD_QUOTA: usize = 1_000;

/// Records to pin in the cache when it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// Stream to preload from.
    pub stream: String,
    /// Records to pin.
    #[serde(default)]
    pub filter: Filter,
}

/// Settings for a store instance.
///
/// # Examples
///
/// ```
/// use obstore_core::StoreConfig;
///
/// let config = StoreConfig::new("data/observations.obs").with_memory_cache_size(512);
/// assert!(config.validate().is_ok());
/// assert!(config.index_obs_location);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Page file location. Parent directories are created on open.
    pub storage_path: Utf8PathBuf,
    /// Bound on resident unpinned cache entries.
    #[serde(default = "default_memory_cache_size")]
    pub memory_cache_size: usize,
    /// Bound on pinned cache entries; the oldest pins are demoted beyond it.
    #[serde(default = "default_preload_quota")]
    pub preload_quota: usize,
    /// Records to pin when a cache starts.
    #[serde(default)]
    pub preload: Option<PreloadConfig>,
    /// Width of a record page's time bucket, in seconds.
    ///
    /// Only used when a page file is created; existing files keep the span
    /// they were written with.
    #[serde(default = "default_bucket_span")]
    pub bucket_span_secs: f64,
    /// Master switch for spatial indexing of record locations.
    #[serde(default = "default_index_obs_location")]
    pub index_obs_location: bool,
}

const fn default_memory_cache_size() -> usize {
    DEFAULT_MEMORY_CACHE_SIZE
}

const fn default_preload_quota() -> usize {
    DEFAULT_PRELOAD_QUOTA
}

const fn default_bucket_span() -> f64 {
    DEFAULT_BUCKET_SPAN_SECS
}

const fn default_index_obs_location() -> bool {
    true
}

/// Errors raised by [`StoreConfig::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The bucket span is not a positive finite number.
    #[error("bucket span must be positive and finite, got {value}")]
    InvalidBucketSpan {
        /// Rejected span.
        value: f64,
    },
    /// The cache could not hold a single entry.
    #[error("memory cache size must be at least 1")]
    ZeroCacheSize,
    /// The preload names no stream.
    #[error("preload stream name is empty")]
    EmptyPreloadStream,
    /// The preload filter is malformed.
    #[error("preload filter is invalid: {0}")]
    InvalidPreloadFilter(#[source] FilterError),
}

impl StoreConfig {
    /// Configuration with defaults for everything but the path.
    #[must_use]
    pub fn new(storage_path: impl AsRef<Utf8Path>) -> Self {
        Self {
            storage_path: storage_path.as_ref().to_path_buf(),
            memory_cache_size: DEFAULT_MEMORY_CACHE_SIZE,
            preload_quota: DEFAULT_PRELOAD_QUOTA,
            preload: None,
            bucket_span_secs: DEFAULT_BUCKET_SPAN_SECS,
            index_obs_location: true,
        }
    }

    /// Set the unpinned cache bound.
    #[must_use]
    pub const fn with_memory_cache_size(mut self, size: usize) -> Self {
        self.memory_cache_size = size;
        self
    }

    /// Set the pinned entry quota.
    #[must_use]
    pub const fn with_preload_quota(mut self, quota: usize) -> Self {
        self.preload_quota = quota;
        self
    }

    /// Pin `filter`'s matches from `stream` when a cache starts.
    #[must_use]
    pub fn with_preload(mut self, stream: impl Into<String>, filter: Filter) -> Self {
        self.preload = Some(PreloadConfig {
            stream: stream.into(),
            filter,
        });
        self
    }

    /// Set the bucket span used for new page files.
    #[must_use]
    pub const fn with_bucket_span(mut self, seconds: f64) -> Self {
        self.bucket_span_secs = seconds;
        self
    }

    /// Enable or disable spatial indexing for every stream.
    #[must_use]
    pub const fn with_location_indexing(mut self, enabled: bool) -> Self {
        self.index_obs_location = enabled;
        self
    }

    /// Reject values the store cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.bucket_span_secs.is_finite() && self.bucket_span_secs > 0.0) {
            return Err(ConfigError::InvalidBucketSpan {
                value: self.bucket_span_secs,
            });
        }
        if self.memory_cache_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        if let Some(preload) = &self.preload {
            if preload.stream.is_empty() {
                return Err(ConfigError::EmptyPreloadStream);
            }
            preload
                .filter
                .validate()
                .map_err(ConfigError::InvalidPreloadFilter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn json_only_needs_a_path() {
        let config: StoreConfig =
            serde_json::from_str(r#"{ "storage_path": "obs/store.obs" }"#).expect("parse config");
        assert_eq!(config, StoreConfig::new("obs/store.obs"));
    }

    #[rstest]
    fn preload_filter_round_trips_through_json() {
        let config = StoreConfig::new("s.obs")
            .with_preload("weather", Filter::new().with_producers(["station-1"]).with_time_range(0.0, 10.0));
        let json = serde_json::to_string(&config).expect("serialise config");
        let parsed: StoreConfig = serde_json::from_str(&json).expect("parse config");
        assert_eq!(parsed, config);
    }

    #[rstest]
    #[case(StoreConfig::new("s.obs").with_bucket_span(0.0), ConfigError::InvalidBucketSpan { value: 0.0 })]
    #[case(StoreConfig::new("s.obs").with_memory_cache_size(0), ConfigError::ZeroCacheSize)]
    #[case(StoreConfig::new("s.obs").with_preload("", Filter::new()), ConfigError::EmptyPreloadStream)]
    #[case(
        StoreConfig::new("s.obs").with_preload("s", Filter::new().with_time_range(2.0, 1.0)),
        ConfigError::InvalidPreloadFilter(FilterError::ReversedTimeRange {
            start: String::from("2"),
            end: String::from("1"),
        })
    )]
    fn invalid_settings_are_rejected(#[case] config: StoreConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate(), Err(expected));
    }
}
