//! Fixed-size header slots at the start of the page file.
//!
//! Two slots alternate between commits. A slot records where the root frame
//! of its commit lives and how long the file was at that point, guarded by a
//! CRC-32 so a torn header write is detected and the other slot used instead.

use super::PageRef;

/// File identifier written at the start of every header slot.
pub(super) const PAGE_FILE_MAGIC: [u8; 4] = *b"OBSP";

/// On-disk format version understood by this build.
pub(super) const PAGE_FILE_VERSION: u16 = 1;

/// Size of one header slot in bytes.
pub(super) const SLOT_LEN: u64 = 64;

/// Total size of the header area; frames start here.
pub(super) const HEADER_AREA_LEN: u64 = 2 * SLOT_LEN;

const CHECKSUMMED_LEN: usize = 40;

/// Decoded contents of one header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct HeaderSlot {
    pub(super) version: u64,
    pub(super) root: PageRef,
    pub(super) committed_len: u64,
}

impl HeaderSlot {
    /// Serialise the slot into its fixed little-endian layout.
    pub(super) fn encode(&self) -> [u8; SLOT_LEN as usize] {
        let mut buf = [0_u8; SLOT_LEN as usize];
        let mut body = Vec::with_capacity(CHECKSUMMED_LEN);
        body.extend_from_slice(&PAGE_FILE_MAGIC);
        body.extend_from_slice(&PAGE_FILE_VERSION.to_le_bytes());
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&self.version.to_le_bytes());
        body.extend_from_slice(&self.root.offset.to_le_bytes());
        body.extend_from_slice(&self.root.len.to_le_bytes());
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(&self.committed_len.to_le_bytes());
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        for (dst, src) in buf.iter_mut().zip(body) {
            *dst = src;
        }
        buf
    }

    /// Decode a slot, returning `None` when it is blank, torn or foreign.
    pub(super) fn decode(bytes: &[u8]) -> Option<Self> {
        let magic: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
        if magic != PAGE_FILE_MAGIC {
            return None;
        }
        let format = u16::from_le_bytes(bytes.get(4..6)?.try_into().ok()?);
        if format != PAGE_FILE_VERSION {
            return None;
        }
        let stored_crc = u32::from_le_bytes(bytes.get(40..44)?.try_into().ok()?);
        if crc32fast::hash(bytes.get(..CHECKSUMMED_LEN)?) != stored_crc {
            return None;
        }
        Some(Self {
            version: read_u64(bytes, 8)?,
            root: PageRef {
                offset: read_u64(bytes, 16)?,
                len: u32::from_le_bytes(bytes.get(24..28)?.try_into().ok()?),
            },
            committed_len: read_u64(bytes, 32)?,
        })
    }
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}
