//! Lazy, pull-based iteration over planned query results.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use geo::Polygon;
use lru::LruCache;

use super::plan::{Plan, Source};
use crate::error::StoreError;
use crate::index::contains_location;
use crate::key::{Record, StoreKey, Timestamp};
use crate::page::{PageReader, PageRef, PageTable};
use crate::record::{PageKey, RecordPage, page_of};
use crate::schema::RecordSchema;

/// Decoded pages kept while following a key list that revisits pages.
const PAGE_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

enum Pending {
    Empty,
    Pages {
        pages: VecDeque<(String, PageRef)>,
        range: (Timestamp, Timestamp),
        buffered: VecDeque<Record>,
    },
    Keys {
        keys: VecDeque<StoreKey>,
        pages: LruCache<PageKey, RecordPage>,
    },
}

/// Lazy sequence of query results.
///
/// The cursor reads one page at a time through its own file handle, so it
/// never blocks writers. A failed page read is yielded once as an error and
/// ends the cursor.
pub struct Cursor {
    stream: String,
    reader: Option<PageReader>,
    table: Arc<PageTable<PageKey>>,
    bucket_span: f64,
    pending: Pending,
    post_region: Option<(Polygon<f64>, Arc<RecordSchema>)>,
    finished: bool,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("stream", &self.stream)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    pub(crate) fn new(
        stream: &str,
        plan: Plan,
        reader: Option<PageReader>,
        table: Arc<PageTable<PageKey>>,
        bucket_span: f64,
        schema: Arc<RecordSchema>,
    ) -> Self {
        let pending = match plan.source {
            Source::Empty => Pending::Empty,
            Source::Scan { producers, range } => {
                let pages = producers
                    .into_iter()
                    .flat_map(|producer| {
                        let bounds = (
                            page_of(stream, &StoreKey::new(producer.as_str(), range.0), bucket_span),
                            page_of(stream, &StoreKey::new(producer.as_str(), range.1), bucket_span),
                        );
                        table
                            .range(bounds.0..=bounds.1)
                            .map(move |(_, page)| (producer.clone(), *page))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                Pending::Pages {
                    pages,
                    range,
                    buffered: VecDeque::new(),
                }
            }
            Source::Keys(keys) => Pending::Keys {
                keys: keys.into(),
                pages: LruCache::new(PAGE_CACHE_CAPACITY),
            },
        };
        let finished = matches!(pending, Pending::Empty);
        Self {
            stream: stream.to_owned(),
            reader,
            table,
            bucket_span,
            pending,
            post_region: plan.post_region.map(|region| (region, schema)),
            finished,
        }
    }

    /// A cursor that yields nothing.
    #[must_use]
    pub fn empty(stream: &str) -> Self {
        Self {
            stream: stream.to_owned(),
            reader: None,
            table: Arc::new(PageTable::new()),
            bucket_span: 1.0,
            pending: Pending::Empty,
            post_region: None,
            finished: true,
        }
    }

    /// Stream the cursor reads from.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    fn advance(&mut self) -> Result<Option<Record>, StoreError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        match &mut self.pending {
            Pending::Empty => Ok(None),
            Pending::Pages {
                pages,
                range,
                buffered,
            } => loop {
                if let Some(record) = buffered.pop_front() {
                    return Ok(Some(record));
                }
                let Some((producer, page)) = pages.pop_front() else {
                    return Ok(None);
                };
                let decoded: RecordPage = reader.read_value(page)?;
                buffered.extend(
                    decoded
                        .into_iter()
                        .filter(|(ts, _)| range.0 <= *ts && *ts <= range.1)
                        .map(|(ts, entry)| entry.into_record(&producer, ts)),
                );
            },
            Pending::Keys { keys, pages } => loop {
                let Some(key) = keys.pop_front() else {
                    return Ok(None);
                };
                let page_key = page_of(&self.stream, &key, self.bucket_span);
                if !pages.contains(&page_key) {
                    let Some(page) = self.table.get(&page_key) else {
                        continue;
                    };
                    let decoded: RecordPage = reader.read_value(*page)?;
                    pages.put(page_key.clone(), decoded);
                }
                let entry = pages
                    .get(&page_key)
                    .and_then(|page| page.get(&key.timestamp))
                    .cloned();
                if let Some(entry) = entry {
                    return Ok(Some(entry.into_record(&key.producer_id, key.timestamp)));
                }
            },
        }
    }

    fn admits(&self, record: &Record) -> bool {
        let Some((region, schema)) = &self.post_region else {
            return true;
        };
        match schema.location(&record.payload) {
            Ok(Some(location)) => contains_location(region, location),
            _ => false,
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            match self.advance() {
                Ok(Some(record)) if self.admits(&record) => return Some(Ok(record)),
                Ok(Some(_)) => {}
                Ok(None) => self.finished = true,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}
