// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - On-disk layout shared by both log kinds
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Every log file starts with a 64-byte header on page 0, followed by entries
// that never cross a page boundary. This module owns the header, the
// id <-> offset transform, and the `EntryLayout` trait through which the
// record and chunk codecs plug into the shared allocation and scanning code.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{LogError, LogResult};
use crate::mapped::Page;

/// Size of the file header; the first entry starts right after it.
pub const FILE_HEADER_SIZE: u64 = 64;

/// Number of 32-bit header fields reserved for the caller.
pub const USER_HEADER_FIELDS: usize = 5;

const MAGIC_WORD_OFFSET: usize = 0;
const IMPLEMENTATION_VERSION_OFFSET: usize = 4;
const DATA_VERSION_OFFSET: usize = 8;
const PAGE_SIZE_OFFSET: usize = 12;
const NEXT_TO_ALLOCATE_OFFSET: usize = 16;
const NEXT_TO_COMMIT_OFFSET: usize = 24;
const ENTRY_COUNT_OFFSET: usize = 32;
const STATUS_OFFSET: usize = 40;
const FIRST_USER_FIELD_OFFSET: usize = 44;

pub(crate) const STATUS_CLOSED: u32 = 0;
pub(crate) const STATUS_OPENED: u32 = 1;

/// Packs four ASCII characters into a magic word.
pub const fn magic_word(ascii: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*ascii)
}

/// Rounds `value` up to a multiple of `alignment` (a power of two).
pub(crate) const fn round_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

// ---------------------------------------------------------------------------
// Id transform
// ---------------------------------------------------------------------------

/// `id = ((offset - FILE_HEADER_SIZE) / alignment) + 1`
pub(crate) fn offset_to_id(offset: u64, alignment: u64) -> LogResult<i64> {
    if offset < FILE_HEADER_SIZE {
        return Err(LogError::InvalidOffset {
            offset,
            reason: "offset points into the file header",
        });
    }
    if offset % alignment != 0 {
        return Err(LogError::InvalidOffset {
            offset,
            reason: "offset is not aligned to the entry alignment",
        });
    }
    let id = (offset - FILE_HEADER_SIZE) / alignment + 1;
    i64::try_from(id).map_err(|_| LogError::InvalidOffset {
        offset,
        reason: "offset is beyond the id range",
    })
}

/// `offset = (id - 1) * alignment + FILE_HEADER_SIZE`
pub(crate) fn id_to_offset(id: i64, alignment: u64) -> LogResult<u64> {
    if id <= 0 {
        return Err(LogError::InvalidId {
            id,
            reason: "ids start at 1",
        });
    }
    (id as u64 - 1)
        .checked_mul(alignment)
        .and_then(|scaled| scaled.checked_add(FILE_HEADER_SIZE))
        .ok_or(LogError::InvalidId {
            id,
            reason: "id is beyond the addressable range",
        })
}

// ---------------------------------------------------------------------------
// Entry layout
// ---------------------------------------------------------------------------

/// Decoded view of the header word at some entry offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Nothing has been written here yet.
    Unset,
    /// Filler up to the end of a page.
    Padding { length: u32 },
    /// A record or chunk. `length` includes the header and alignment;
    /// `finished` is false while the writer is still filling a record.
    Data {
        length: u32,
        payload_len: u32,
        finished: bool,
    },
    /// Bits that no writer produces.
    Invalid { raw: u64 },
}

impl Slot {
    /// Number of bytes to skip to reach the next entry, if known.
    pub(crate) fn length(self) -> Option<u32> {
        match self {
            Slot::Padding { length } | Slot::Data { length, .. } => Some(length),
            Slot::Unset | Slot::Invalid { .. } => None,
        }
    }
}

/// Codec for one kind of entry.
pub(crate) trait EntryLayout {
    /// Human readable kind, used in errors and logs.
    const KIND: &'static str;
    const MAGIC_WORD: u32;
    const IMPLEMENTATION_VERSION: u32;
    /// Entry alignment; also the id granularity.
    const ALIGNMENT: u64;
    const HEADER_SIZE: u32;
    const MAX_PAGE_SIZE: u32;

    /// Loads and decodes the header at `offset` (acquire ordering).
    fn read_slot(page: &Page, offset: usize) -> Slot;

    /// Loads the raw header bits at `offset`.
    fn raw_header(page: &Page, offset: usize) -> u64;

    /// Publishes a padding entry of `length` bytes at `offset`.
    fn put_padding(page: &Page, offset: usize, length: u32);
}

// ---------------------------------------------------------------------------
// FileHeader
// ---------------------------------------------------------------------------

/// Live view of the 64-byte header on page 0.
///
/// ```text
/// [ 0.. 4] magic word
/// [ 4.. 8] implementation version
/// [ 8..12] data version (caller defined)
/// [12..16] page size
/// [16..24] next offset to allocate
/// [24..32] next offset to commit
/// [32..40] entry count
/// [40..44] status (1 = open, 0 = closed cleanly)
/// [44..64] caller defined fields
/// ```
pub(crate) struct FileHeader {
    page: Arc<Page>,
}

impl FileHeader {
    pub(crate) fn new(page: Arc<Page>) -> Self {
        assert_eq!(page.index(), 0, "the file header lives on page 0");
        Self { page }
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        self.page.atomic_u32(offset)
    }

    pub(crate) fn magic_word(&self) -> u32 {
        self.word(MAGIC_WORD_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn implementation_version(&self) -> u32 {
        self.word(IMPLEMENTATION_VERSION_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.word(PAGE_SIZE_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn data_version(&self) -> u32 {
        self.word(DATA_VERSION_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn set_data_version(&self, version: u32) {
        self.word(DATA_VERSION_OFFSET).store(version, Ordering::Release);
    }

    pub(crate) fn status(&self) -> u32 {
        self.word(STATUS_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: u32) {
        self.word(STATUS_OFFSET).store(status, Ordering::Release);
    }

    pub(crate) fn allocated(&self) -> &AtomicU64 {
        self.page.atomic_u64(NEXT_TO_ALLOCATE_OFFSET)
    }

    pub(crate) fn committed(&self) -> &AtomicU64 {
        self.page.atomic_u64(NEXT_TO_COMMIT_OFFSET)
    }

    pub(crate) fn entry_count(&self) -> &AtomicU64 {
        self.page.atomic_u64(ENTRY_COUNT_OFFSET)
    }

    pub(crate) fn user_field(&self, field: usize) -> LogResult<&AtomicU32> {
        if field >= USER_HEADER_FIELDS {
            return Err(LogError::HeaderFieldOutOfRange {
                field,
                available: USER_HEADER_FIELDS,
            });
        }
        Ok(self.word(FIRST_USER_FIELD_OFFSET + field * 4))
    }

    /// Writes the header of a brand new file.
    pub(crate) fn initialize(&self, magic: u32, implementation_version: u32, page_size: u32) {
        self.word(IMPLEMENTATION_VERSION_OFFSET)
            .store(implementation_version, Ordering::Release);
        self.word(PAGE_SIZE_OFFSET).store(page_size, Ordering::Release);
        self.word(DATA_VERSION_OFFSET).store(0, Ordering::Release);
        self.allocated().store(FILE_HEADER_SIZE, Ordering::Release);
        self.committed().store(FILE_HEADER_SIZE, Ordering::Release);
        self.entry_count().store(0, Ordering::Release);
        self.set_status(STATUS_CLOSED);
        // Magic goes last: a file with a magic word has a complete header.
        self.word(MAGIC_WORD_OFFSET).store(magic, Ordering::Release);
    }

    pub(crate) fn flush(&self) -> LogResult<()> {
        self.page.flush_range(0, FILE_HEADER_SIZE as usize)
    }
}

// ---------------------------------------------------------------------------
// HeaderSnapshot
// ---------------------------------------------------------------------------

/// A copy of a log file header, read without mapping the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderSnapshot {
    pub magic_word: u32,
    pub implementation_version: u32,
    pub data_version: u32,
    pub page_size: u32,
    pub next_to_allocate: u64,
    pub next_to_commit: u64,
    pub entry_count: u64,
    pub status: u32,
    pub user_fields: [u32; USER_HEADER_FIELDS],
}

impl HeaderSnapshot {
    /// Reads the header of the file at `path`.
    ///
    /// Returns `None` if the file does not exist or is shorter than a header.
    pub fn read(path: impl AsRef<Path>) -> LogResult<Option<Self>> {
        let mut file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let mut raw = [0u8; FILE_HEADER_SIZE as usize];
        match file.read_exact(&mut raw) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(error) => return Err(error.into()),
        }
        Ok(Some(Self::decode(&raw)))
    }

    fn decode(raw: &[u8; FILE_HEADER_SIZE as usize]) -> Self {
        let u32_at = |offset: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&raw[offset..offset + 4]);
            u32::from_ne_bytes(word)
        };
        let u64_at = |offset: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&raw[offset..offset + 8]);
            u64::from_ne_bytes(word)
        };
        let mut user_fields = [0u32; USER_HEADER_FIELDS];
        for (field, value) in user_fields.iter_mut().enumerate() {
            *value = u32_at(FIRST_USER_FIELD_OFFSET + field * 4);
        }
        Self {
            magic_word: u32_at(MAGIC_WORD_OFFSET),
            implementation_version: u32_at(IMPLEMENTATION_VERSION_OFFSET),
            data_version: u32_at(DATA_VERSION_OFFSET),
            page_size: u32_at(PAGE_SIZE_OFFSET),
            next_to_allocate: u64_at(NEXT_TO_ALLOCATE_OFFSET),
            next_to_commit: u64_at(NEXT_TO_COMMIT_OFFSET),
            entry_count: u64_at(ENTRY_COUNT_OFFSET),
            status: u32_at(STATUS_OFFSET),
            user_fields,
        }
    }

    /// True if the file was closed cleanly.
    pub fn was_closed_properly(&self) -> bool {
        self.status == STATUS_CLOSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapped::MappedFile;
    use tempfile::TempDir;

    #[test]
    fn test_magic_word_is_big_endian_ascii() {
        assert_eq!(magic_word(b"AOLM"), 0x414F_4C4D);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(13, 4), 16);
    }

    #[test]
    fn test_id_transform_examples() {
        assert_eq!(offset_to_id(64, 4).unwrap(), 1);
        assert_eq!(offset_to_id(68, 4).unwrap(), 2);
        assert_eq!(offset_to_id(80, 8).unwrap(), 3);
        assert_eq!(id_to_offset(1, 4).unwrap(), 64);
        assert_eq!(id_to_offset(3, 8).unwrap(), 80);
    }

    #[test]
    fn test_id_transform_rejections() {
        assert!(matches!(id_to_offset(0, 4), Err(LogError::InvalidId { id: 0, .. })));
        assert!(matches!(id_to_offset(-7, 4), Err(LogError::InvalidId { .. })));
        assert!(matches!(id_to_offset(i64::MAX, 8), Err(LogError::InvalidId { .. })));
        assert!(matches!(offset_to_id(10, 4), Err(LogError::InvalidOffset { .. })));
        assert!(matches!(offset_to_id(66, 4), Err(LogError::InvalidOffset { .. })));
    }

    #[test]
    fn test_huge_ids_round_trip_or_fail_loudly() {
        let offset = id_to_offset(1 << 60, 4).unwrap();
        assert_eq!(offset_to_id(offset, 4).unwrap(), 1 << 60);
        assert!(id_to_offset(i64::MAX, 4).is_err());

        let top = offset_to_id(u64::MAX - 7, 8).unwrap();
        assert_eq!(id_to_offset(top, 8).unwrap(), u64::MAX - 7);
    }

    #[test]
    fn test_header_roundtrip_through_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.bin");
        let file = MappedFile::open(&path, 4096).unwrap();
        let header = FileHeader::new(file.page(0).unwrap());
        header.initialize(magic_word(b"TEST"), 7, 4096);
        header.set_data_version(42);
        header.user_field(4).unwrap().store(99, Ordering::Release);
        header.set_status(STATUS_OPENED);
        assert!(header.user_field(5).is_err());
        drop(header);
        file.close().unwrap();

        let snapshot = HeaderSnapshot::read(&path).unwrap().unwrap();
        assert_eq!(snapshot.magic_word, magic_word(b"TEST"));
        assert_eq!(snapshot.implementation_version, 7);
        assert_eq!(snapshot.data_version, 42);
        assert_eq!(snapshot.page_size, 4096);
        assert_eq!(snapshot.next_to_allocate, FILE_HEADER_SIZE);
        assert_eq!(snapshot.next_to_commit, FILE_HEADER_SIZE);
        assert_eq!(snapshot.user_fields, [0, 0, 0, 0, 99]);
        assert!(!snapshot.was_closed_properly());
    }

    #[test]
    fn test_snapshot_of_missing_or_short_file() {
        let dir = TempDir::new().unwrap();
        assert!(HeaderSnapshot::read(dir.path().join("absent")).unwrap().is_none());
        let short = dir.path().join("short");
        std::fs::write(&short, [1u8; 10]).unwrap();
        assert!(HeaderSnapshot::read(&short).unwrap().is_none());
    }
}
