//! Length-prefixed, checksummed frames appended after the header area.
//!
//! A frame is `[len: u32][crc32: u32][bytes]`. Frames are never rewritten;
//! a page update appends a new frame and repoints the page table.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::PageRef;

/// Bytes preceding the payload of every frame.
pub(super) const FRAME_HEADER_LEN: u64 = 8;

/// Failure to read a frame back.
#[derive(Debug)]
pub(super) enum FrameError {
    Io(io::Error),
    Corrupt(String),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Write `bytes` as a frame starting at `offset`.
///
/// The caller guarantees `bytes.len()` fits in a `u32`.
pub(super) fn write_frame(file: &mut File, offset: u64, bytes: &[u8], len: u32) -> io::Result<()> {
    let mut frame = Vec::with_capacity(bytes.len() + FRAME_HEADER_LEN as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());
    frame.extend_from_slice(bytes);
    write_at(file, offset, &frame)
}

/// Overwrite `bytes` at `offset`.
pub(super) fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

/// Fill `buf` from `offset`.
pub(super) fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

/// Read and verify the frame referenced by `page`.
pub(super) fn read_frame(file: &mut File, page: PageRef) -> Result<Vec<u8>, FrameError> {
    let mut header = [0_u8; FRAME_HEADER_LEN as usize];
    read_exact_at(file, page.offset, &mut header)?;
    let (len_bytes, crc_bytes) = header.split_at(4);
    let len = u32::from_le_bytes(to_array(len_bytes)?);
    if len != page.len {
        return Err(FrameError::Corrupt(format!(
            "frame at offset {} has length {len}, page table expects {}",
            page.offset, page.len
        )));
    }
    let mut body = vec![0_u8; len as usize];
    file.read_exact(&mut body)?;
    let expected = u32::from_le_bytes(to_array(crc_bytes)?);
    let actual = crc32fast::hash(&body);
    if expected != actual {
        return Err(FrameError::Corrupt(format!(
            "frame at offset {} failed its checksum",
            page.offset
        )));
    }
    Ok(body)
}

fn to_array(bytes: &[u8]) -> Result<[u8; 4], FrameError> {
    bytes
        .try_into()
        .map_err(|_| FrameError::Corrupt(String::from("short frame header")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use tempfile::NamedTempFile;

    #[fixture]
    fn scratch() -> NamedTempFile {
        NamedTempFile::new().expect("create temp file")
    }

    #[rstest]
    fn frames_read_back_at_their_offset(scratch: NamedTempFile) {
        let mut file = scratch.reopen().expect("reopen temp file");
        write_frame(&mut file, 0, b"first", 5).expect("write first");
        write_frame(&mut file, 13, b"second", 6).expect("write second");
        let second = read_frame(&mut file, PageRef { offset: 13, len: 6 }).expect("read second");
        assert_eq!(second, b"second");
    }

    #[rstest]
    fn corrupted_payload_is_reported(scratch: NamedTempFile) {
        let mut file = scratch.reopen().expect("reopen temp file");
        write_frame(&mut file, 0, b"payload", 7).expect("write frame");
        write_at(&mut file, 9, b"X").expect("corrupt one byte");
        let err = read_frame(&mut file, PageRef { offset: 0, len: 7 }).expect_err("checksum");
        assert!(matches!(err, FrameError::Corrupt(_)));
    }

    #[rstest]
    fn mismatched_length_is_reported(scratch: NamedTempFile) {
        let mut file = scratch.reopen().expect("reopen temp file");
        write_frame(&mut file, 0, b"payload", 7).expect("write frame");
        let err = read_frame(&mut file, PageRef { offset: 0, len: 3 }).expect_err("length");
        assert!(matches!(err, FrameError::Corrupt(_)));
    }
}
