//! Durable, versioned key to page persistence.
//!
//! The page store keeps every page as an immutable frame in a single
//! append-only file. A commit appends the serialised page table as a root
//! frame, then repoints one of two header slots at it; the header write is the
//! atomic switch between versions. Anything written after the last header
//! switch is discarded when the file is reopened or rolled back.
//!
//! Readers hold their own [`PageReader`] file handle and only follow refs from
//! a committed table, so they never observe frames that may be truncated.
//!
//! Updated pages leave their old frames behind. Once those dead frames
//! outweigh the live ones, [`PageStore::write_compacted`] copies the live
//! pages into a fresh file and [`PageStore::install`] renames it over the
//! old one. Readers opened before the swap keep the old file.

mod frame;
mod header;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use frame::{FRAME_HEADER_LEN, FrameError, read_frame, write_at, write_frame};
use header::{HEADER_AREA_LEN, HeaderSlot, SLOT_LEN};

/// Monotonic commit counter.
pub type VersionId = u64;

/// Location of one frame in the page file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    /// Byte offset of the frame header.
    pub offset: u64,
    /// Payload length in bytes.
    pub len: u32,
}

/// Committed mapping from page keys to frames.
pub type PageTable<K> = BTreeMap<K, PageRef>;

/// Files smaller than this are never compacted.
pub const COMPACTION_MIN_LEN: u64 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct RootFrame<K: Ord> {
    version: VersionId,
    pages: PageTable<K>,
}

/// Errors raised by the page store.
#[derive(Debug, Error)]
pub enum PageStoreError {
    /// The page file could not be read or written.
    #[error("page file I/O failed for {path}: {source}")]
    Io {
        /// Location of the page file.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The file contents do not form a valid page store.
    #[error("page file {path} is corrupt: {reason}")]
    Corrupt {
        /// Location of the page file.
        path: Utf8PathBuf,
        /// Description of the damage.
        reason: String,
    },
    /// A page could not be serialised.
    #[error("failed to encode page for {path}: {source}")]
    Encode {
        /// Location of the page file.
        path: Utf8PathBuf,
        /// Encoder failure from `bincode`.
        #[source]
        source: bincode::Error,
    },
    /// A page could not be deserialised.
    #[error("failed to decode page from {path}: {source}")]
    Decode {
        /// Location of the page file.
        path: Utf8PathBuf,
        /// Decoder failure from `bincode`.
        #[source]
        source: bincode::Error,
    },
    /// A compacted copy no longer matches the store it was taken from.
    #[error("cannot compact {path}: {reason}")]
    CompactionConflict {
        /// Location of the page file.
        path: Utf8PathBuf,
        /// Why the copy was refused.
        reason: String,
    },
    /// A page exceeds the maximum frame size.
    #[error("page of {len} bytes for {path} exceeds the frame size limit")]
    PageTooLarge {
        /// Location of the page file.
        path: Utf8PathBuf,
        /// Size of the rejected page.
        len: usize,
    },
}

impl PageStoreError {
    fn io(path: &Utf8Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Utf8Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn from_frame(path: &Utf8Path, err: FrameError) -> Self {
        match err {
            FrameError::Io(source) => Self::Io {
                path: path.to_path_buf(),
                source,
            },
            FrameError::Corrupt(reason) => Self::corrupt(path, reason),
        }
    }
}

/// Single-writer page store over one file.
///
/// # Examples
///
/// ```
/// use camino::Utf8PathBuf;
/// use obstore_core::page::PageStore;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempfile::tempdir()?;
/// let path = Utf8PathBuf::from_path_buf(dir.path().join("pages.obs")).map_err(|_| "utf-8")?;
/// let mut store: PageStore<String> = PageStore::open(&path)?;
/// store.put(String::from("greeting"), b"hello")?;
/// let version = store.commit()?;
///
/// let mut reopened: PageStore<String> = PageStore::open(&path)?;
/// assert_eq!(reopened.version(), version);
/// assert_eq!(reopened.get(&String::from("greeting"))?, Some(b"hello".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct PageStore<K> {
    path: Utf8PathBuf,
    file: File,
    table: Arc<PageTable<K>>,
    root: PageRef,
    pending: BTreeMap<K, Option<PageRef>>,
    version: VersionId,
    committed_len: u64,
    end: u64,
    active_slot: u64,
}

/// Live pages copied into a fresh file, waiting for [`PageStore::install`].
#[derive(Debug)]
pub struct Compaction<K> {
    temp_path: Utf8PathBuf,
    file: File,
    table: PageTable<K>,
    root: PageRef,
    version: VersionId,
    end: u64,
}

impl<K> Compaction<K> {
    /// Size of the compacted file in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end
    }

    /// Whether the compacted file holds nothing but its header.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= HEADER_AREA_LEN
    }

    fn discard(self) {
        drop(self.file);
        remove_stale(&self.temp_path);
    }
}

fn compaction_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.compact"))
}

fn remove_stale(path: &Utf8Path) {
    if let Err(err) = std::fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!("could not remove {path}: {err}");
    }
}

/// Make a rename inside `path`'s directory durable.
#[cfg(unix)]
fn sync_parent(path: &Utf8Path) {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
        warn!("could not sync directory {parent}: {err}");
    }
}

#[cfg(not(unix))]
const fn sync_parent(_path: &Utf8Path) {}

/// Whether the file holds no committed header, only zeroes written before
/// the first commit finished.
fn never_committed(file: &mut File, len: u64) -> io::Result<bool> {
    let mut header = vec![0_u8; usize::try_from(len.min(HEADER_AREA_LEN)).unwrap_or_default()];
    frame::read_exact_at(file, 0, &mut header)?;
    Ok(header.iter().all(|byte| *byte == 0))
}

impl<K> std::fmt::Debug for PageStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("committed_len", &self.committed_len)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<K> PageStore<K>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
{
    /// Open the page file at `path`, creating it when absent.
    ///
    /// An existing file is recovered to its newest intact commit and any
    /// trailing uncommitted bytes are truncated.
    pub fn open(path: &Utf8Path) -> Result<Self, PageStoreError> {
        remove_stale(&compaction_path(path));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(PageStoreError::io(path))?;
        let len = file.metadata().map_err(PageStoreError::io(path))?.len();
        let blank = len > 0 && never_committed(&mut file, len).map_err(PageStoreError::io(path))?;
        if blank {
            warn!("{path} was never committed; starting a fresh store");
            file.set_len(0).map_err(PageStoreError::io(path))?;
        }
        let store = if len == 0 || blank {
            Self::initialise(path, file)?
        } else {
            Self::recover(path, file, len)?
        };
        info!(
            "opened page file {} at version {} ({} pages)",
            store.path,
            store.version,
            store.table.len()
        );
        Ok(store)
    }

    fn initialise(path: &Utf8Path, file: File) -> Result<Self, PageStoreError> {
        let mut store = Self {
            path: path.to_path_buf(),
            file,
            table: Arc::new(PageTable::new()),
            root: PageRef { offset: 0, len: 0 },
            pending: BTreeMap::new(),
            version: 0,
            committed_len: 0,
            end: HEADER_AREA_LEN,
            active_slot: 1,
        };
        write_at(&mut store.file, 0, &[0_u8; HEADER_AREA_LEN as usize])
            .map_err(PageStoreError::io(path))?;
        store.write_commit(0, PageTable::new())?;
        Ok(store)
    }

    fn recover(path: &Utf8Path, mut file: File, len: u64) -> Result<Self, PageStoreError> {
        let mut header = [0_u8; HEADER_AREA_LEN as usize];
        frame::read_exact_at(&mut file, 0, &mut header)
            .map_err(|_| PageStoreError::corrupt(path, "file is shorter than its header"))?;
        let (first, second) = header.split_at(SLOT_LEN as usize);
        let mut candidates: Vec<(u64, HeaderSlot)> = [first, second]
            .into_iter()
            .zip(0_u64..)
            .filter_map(|(bytes, index)| HeaderSlot::decode(bytes).map(|slot| (index, slot)))
            .collect();
        candidates.sort_by(|a, b| b.1.version.cmp(&a.1.version));

        for (index, slot) in candidates {
            match Self::load_root(path, &mut file, len, slot) {
                Ok(table) => {
                    if len > slot.committed_len {
                        warn!(
                            "discarding {} uncommitted bytes from {path}",
                            len - slot.committed_len
                        );
                        file.set_len(slot.committed_len)
                            .map_err(PageStoreError::io(path))?;
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        file,
                        table: Arc::new(table),
                        root: slot.root,
                        pending: BTreeMap::new(),
                        version: slot.version,
                        committed_len: slot.committed_len,
                        end: slot.committed_len,
                        active_slot: index,
                    });
                }
                Err(err) => warn!("header slot {index} of {path} is unusable: {err}"),
            }
        }
        Err(PageStoreError::corrupt(path, "no valid header slot"))
    }

    fn load_root(
        path: &Utf8Path,
        file: &mut File,
        len: u64,
        slot: HeaderSlot,
    ) -> Result<PageTable<K>, PageStoreError> {
        let root_end = slot.root.offset + FRAME_HEADER_LEN + u64::from(slot.root.len);
        if slot.committed_len > len || root_end > slot.committed_len {
            return Err(PageStoreError::corrupt(
                path,
                "root frame lies beyond the end of the file",
            ));
        }
        let bytes =
            read_frame(file, slot.root).map_err(|err| PageStoreError::from_frame(path, err))?;
        let root: RootFrame<K> =
            bincode::deserialize(&bytes).map_err(|source| PageStoreError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        if root.version != slot.version {
            return Err(PageStoreError::corrupt(
                path,
                format!(
                    "root frame version {} does not match header version {}",
                    root.version, slot.version
                ),
            ));
        }
        Ok(root.pages)
    }

    /// Location of the page file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Version of the last successful commit.
    #[must_use]
    pub const fn version(&self) -> VersionId {
        self.version
    }

    /// Committed page table, shared with readers.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PageTable<K>> {
        Arc::clone(&self.table)
    }

    /// Whether uncommitted page changes exist.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Write `bytes` as the new contents of `key`.
    ///
    /// The page becomes visible to readers of the committed table only after
    /// [`PageStore::commit`].
    pub fn put(&mut self, key: K, bytes: &[u8]) -> Result<PageRef, PageStoreError> {
        let page = self.append(bytes)?;
        self.pending.insert(key, Some(page));
        Ok(page)
    }

    /// Serialise `value` with `bincode` and store it under `key`.
    pub fn put_value<T: Serialize>(&mut self, key: K, value: &T) -> Result<PageRef, PageStoreError> {
        let bytes = bincode::serialize(value).map_err(|source| PageStoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        self.put(key, &bytes)
    }

    /// Drop `key` from the next commit.
    pub fn remove(&mut self, key: K) {
        self.pending.insert(key, None);
    }

    /// Read the latest contents of `key`, including uncommitted writes.
    pub fn get(&mut self, key: &K) -> Result<Option<Vec<u8>>, PageStoreError> {
        let page = match self.pending.get(key) {
            Some(change) => *change,
            None => self.table.get(key).copied(),
        };
        let Some(page) = page else {
            return Ok(None);
        };
        read_frame(&mut self.file, page)
            .map(Some)
            .map_err(|err| PageStoreError::from_frame(&self.path, err))
    }

    /// Read the latest contents of `key` and decode them with `bincode`.
    pub fn get_value<T: DeserializeOwned>(&mut self, key: &K) -> Result<Option<T>, PageStoreError> {
        let Some(bytes) = self.get(key)? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|source| PageStoreError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Durably publish every pending page and return the new version.
    ///
    /// On error the store is left at the previous version with its pending
    /// pages intact; call [`PageStore::rollback_to_last_commit`] to discard
    /// them.
    pub fn commit(&mut self) -> Result<VersionId, PageStoreError> {
        let mut table = PageTable::clone(&self.table);
        for (key, change) in &self.pending {
            match change {
                Some(page) => {
                    table.insert(key.clone(), *page);
                }
                None => {
                    table.remove(key);
                }
            }
        }
        let version = self.version + 1;
        self.write_commit(version, table)?;
        self.pending.clear();
        Ok(version)
    }

    fn write_commit(&mut self, version: VersionId, pages: PageTable<K>) -> Result<(), PageStoreError> {
        let root = RootFrame { version, pages };
        let bytes = bincode::serialize(&root).map_err(|source| PageStoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        let root_ref = self.append(&bytes)?;
        self.file.sync_data().map_err(PageStoreError::io(&self.path))?;

        let target = 1 - self.active_slot;
        let slot = HeaderSlot {
            version,
            root: root_ref,
            committed_len: self.end,
        };
        write_at(&mut self.file, target * SLOT_LEN, &slot.encode())
            .map_err(PageStoreError::io(&self.path))?;
        self.file.sync_data().map_err(PageStoreError::io(&self.path))?;

        self.table = Arc::new(root.pages);
        self.root = root_ref;
        self.version = version;
        self.committed_len = self.end;
        self.active_slot = target;
        Ok(())
    }

    /// Discard every page written since the last commit.
    pub fn rollback_to_last_commit(&mut self) -> Result<(), PageStoreError> {
        self.pending.clear();
        self.file
            .set_len(self.committed_len)
            .map_err(PageStoreError::io(&self.path))?;
        self.end = self.committed_len;
        Ok(())
    }

    /// Open an independent read handle on the page file.
    pub fn reader(&self) -> Result<PageReader, PageStoreError> {
        PageReader::open(&self.path)
    }

    /// Bytes of the committed file still referenced: every page frame plus
    /// the root frame.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.table
            .values()
            .chain(std::iter::once(&self.root))
            .map(|page| FRAME_HEADER_LEN + u64::from(page.len))
            .sum()
    }

    /// Bytes of the committed file taken by superseded frames.
    #[must_use]
    pub fn dead_bytes(&self) -> u64 {
        self.committed_len
            .saturating_sub(HEADER_AREA_LEN)
            .saturating_sub(self.live_bytes())
    }

    /// Whether dead frames outweigh live ones in a file of at least
    /// [`COMPACTION_MIN_LEN`] bytes.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.committed_len >= COMPACTION_MIN_LEN && self.dead_bytes() > self.live_bytes()
    }

    /// Copy every committed page into a fresh file next to this one.
    ///
    /// The copy keeps the current version. Nothing changes for this store or
    /// its readers until the result is passed to [`PageStore::install`].
    pub fn write_compacted(&mut self) -> Result<Compaction<K>, PageStoreError> {
        self.ensure_quiescent()?;
        let temp_path = compaction_path(&self.path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(PageStoreError::io(&temp_path))?;
        match self.copy_live(&mut file, &temp_path) {
            Ok((table, root, end)) => Ok(Compaction {
                temp_path,
                file,
                table,
                root,
                version: self.version,
                end,
            }),
            Err(err) => {
                drop(file);
                remove_stale(&temp_path);
                Err(err)
            }
        }
    }

    fn copy_live(
        &mut self,
        file: &mut File,
        temp_path: &Utf8Path,
    ) -> Result<(PageTable<K>, PageRef, u64), PageStoreError> {
        write_at(file, 0, &[0_u8; HEADER_AREA_LEN as usize]).map_err(PageStoreError::io(temp_path))?;
        let mut end = HEADER_AREA_LEN;
        let mut pages = PageTable::new();
        for (key, page) in self.table.iter() {
            let bytes = read_frame(&mut self.file, *page)
                .map_err(|err| PageStoreError::from_frame(&self.path, err))?;
            write_frame(file, end, &bytes, page.len).map_err(PageStoreError::io(temp_path))?;
            pages.insert(key.clone(), PageRef { offset: end, len: page.len });
            end += FRAME_HEADER_LEN + u64::from(page.len);
        }

        let root = RootFrame {
            version: self.version,
            pages,
        };
        let bytes = bincode::serialize(&root).map_err(|source| PageStoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        let len = self.frame_len(&bytes)?;
        let root_ref = PageRef { offset: end, len };
        write_frame(file, end, &bytes, len).map_err(PageStoreError::io(temp_path))?;
        end += FRAME_HEADER_LEN + u64::from(len);

        let slot = HeaderSlot {
            version: self.version,
            root: root_ref,
            committed_len: end,
        };
        write_at(file, 0, &slot.encode()).map_err(PageStoreError::io(temp_path))?;
        file.sync_all().map_err(PageStoreError::io(temp_path))?;
        Ok((root.pages, root_ref, end))
    }

    /// Replace the page file with a copy from [`PageStore::write_compacted`].
    ///
    /// The copy is refused when this store has committed or buffered pages
    /// since it was taken.
    pub fn install(&mut self, compaction: Compaction<K>) -> Result<(), PageStoreError> {
        if compaction.version != self.version {
            let reason = format!(
                "copy is of version {}, store is at {}",
                compaction.version, self.version
            );
            compaction.discard();
            return Err(PageStoreError::CompactionConflict {
                path: self.path.clone(),
                reason,
            });
        }
        if let Err(err) = self.ensure_quiescent() {
            compaction.discard();
            return Err(err);
        }
        if let Err(source) = std::fs::rename(&compaction.temp_path, &self.path) {
            compaction.discard();
            return Err(PageStoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        sync_parent(&self.path);

        let reclaimed = self.committed_len.saturating_sub(compaction.end);
        self.file = compaction.file;
        self.table = Arc::new(compaction.table);
        self.root = compaction.root;
        self.committed_len = compaction.end;
        self.end = compaction.end;
        self.active_slot = 0;
        info!(
            "compacted {} to {} bytes, reclaiming {reclaimed}",
            self.path, self.committed_len
        );
        Ok(())
    }

    /// Compact the page file in one step.
    pub fn compact(&mut self) -> Result<(), PageStoreError> {
        let compaction = self.write_compacted()?;
        self.install(compaction)
    }

    fn ensure_quiescent(&self) -> Result<(), PageStoreError> {
        if self.pending.is_empty() && self.end == self.committed_len {
            Ok(())
        } else {
            Err(PageStoreError::CompactionConflict {
                path: self.path.clone(),
                reason: String::from("uncommitted pages are buffered"),
            })
        }
    }

    fn frame_len(&self, bytes: &[u8]) -> Result<u32, PageStoreError> {
        u32::try_from(bytes.len()).map_err(|_| PageStoreError::PageTooLarge {
            path: self.path.clone(),
            len: bytes.len(),
        })
    }

    fn append(&mut self, bytes: &[u8]) -> Result<PageRef, PageStoreError> {
        let len = self.frame_len(bytes)?;
        let page = PageRef {
            offset: self.end,
            len,
        };
        write_frame(&mut self.file, self.end, bytes, len).map_err(PageStoreError::io(&self.path))?;
        self.end += FRAME_HEADER_LEN + u64::from(len);
        Ok(page)
    }
}

/// Read-only handle on a page file.
///
/// Frames referenced by a committed table are immutable, so a reader never
/// needs to coordinate with the writer.
#[derive(Debug)]
pub struct PageReader {
    path: Utf8PathBuf,
    file: File,
}

impl PageReader {
    /// Open a read handle on `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, PageStoreError> {
        let file = File::open(path).map_err(PageStoreError::io(path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Read and verify the frame at `page`.
    pub fn read(&mut self, page: PageRef) -> Result<Vec<u8>, PageStoreError> {
        read_frame(&mut self.file, page).map_err(|err| PageStoreError::from_frame(&self.path, err))
    }

    /// Read the frame at `page` and decode it with `bincode`.
    pub fn read_value<T: DeserializeOwned>(&mut self, page: PageRef) -> Result<T, PageStoreError> {
        let bytes = self.read(page)?;
        bincode::deserialize(&bytes).map_err(|source| PageStoreError::Decode {
            path: self.path.clone(),
            source,
        })
    }
}
