//! Result sequence of [`CachedStore::get_records`].

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::iter::Peekable;
use std::vec;

use log::warn;

use super::{CachedStore, POPULATE_BATCH};
use crate::error::StoreError;
use crate::filter::{Cursor, ResultOrdering};
use crate::key::{Record, StoreKey};
use crate::store::StreamHandle;

struct Merge<'a> {
    cache: &'a CachedStore,
    handle: StreamHandle,
    cursor: Option<Cursor>,
    cached_keys: BTreeSet<StoreKey>,
    next_committed: Option<Record>,
    batch: Vec<(StoreKey, Record)>,
}

impl Merge<'_> {
    /// Pull the next committed record the cache does not shadow.
    fn fill(&mut self) -> Result<(), StoreError> {
        if self.next_committed.is_some() {
            return Ok(());
        }
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(());
            };
            let record = match cursor.next() {
                Some(Ok(record)) => record,
                Some(Err(err)) => {
                    self.cursor = None;
                    self.flush();
                    return Err(err);
                }
                None => {
                    self.cursor = None;
                    self.flush();
                    return Ok(());
                }
            };
            let Some(key) = record.key.store_key() else {
                continue;
            };
            if self.cached_keys.contains(&key) {
                continue;
            }
            self.batch.push((key, record.clone()));
            if self.batch.len() >= POPULATE_BATCH {
                self.flush();
            }
            self.next_committed = Some(record);
            return Ok(());
        }
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        if let Err(err) = self.cache.populate(&self.handle, batch) {
            warn!("could not cache records of `{}`: {err}", self.handle.name());
        }
    }
}

/// Records produced by a cached query, in the filter's ordering.
///
/// Committed records read along the way are added to the cache in batches.
pub struct CachedRecords<'a> {
    cached: Peekable<vec::IntoIter<Record>>,
    merge: Option<Merge<'a>>,
    ordering: ResultOrdering,
    failed: bool,
}

impl fmt::Debug for CachedRecords<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedRecords")
            .field("ordering", &self.ordering)
            .field("reads_store", &self.merge.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a> CachedRecords<'a> {
    /// Results already complete in memory.
    pub(super) fn eager(records: Vec<Record>, ordering: ResultOrdering) -> Self {
        Self {
            cached: records.into_iter().peekable(),
            merge: None,
            ordering,
            failed: false,
        }
    }

    /// Sorted cached matches merged with a store cursor.
    pub(super) fn merged(
        cache: &'a CachedStore,
        handle: StreamHandle,
        cached: Vec<Record>,
        cached_keys: BTreeSet<StoreKey>,
        cursor: Cursor,
        ordering: ResultOrdering,
    ) -> Self {
        Self {
            cached: cached.into_iter().peekable(),
            merge: Some(Merge {
                cache,
                handle,
                cursor: Some(cursor),
                cached_keys,
                next_committed: None,
                batch: Vec::new(),
            }),
            ordering,
            failed: false,
        }
    }
}

impl Iterator for CachedRecords<'_> {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let Some(merge) = self.merge.as_mut() else {
            return self.cached.next().map(Ok);
        };
        if let Err(err) = merge.fill() {
            self.failed = true;
            return Some(Err(err));
        }
        let take_cached = match (self.cached.peek(), merge.next_committed.as_ref()) {
            (Some(cached), Some(committed)) => {
                self.ordering.compare(&cached.key, &committed.key) != Ordering::Greater
            }
            (Some(_), None) => true,
            (None, _) => false,
        };
        if take_cached {
            self.cached.next().map(Ok)
        } else {
            merge.next_committed.take().map(Ok)
        }
    }
}

impl Drop for CachedRecords<'_> {
    fn drop(&mut self) {
        if let Some(merge) = self.merge.as_mut() {
            merge.flush();
        }
    }
}
