// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Record codec
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A record is a 32-bit header followed by its payload, padded to 4 bytes:
//
// ```text
// bit  31     : padding flag
// bit  30     : committed flag
// bits 0..=29 : total length, header included, before alignment
// ```
//
// A writer first publishes the header without the committed flag, fills the
// payload, then republishes the header with the flag set. Padding records are
// always published committed.

use std::sync::atomic::Ordering;

use crate::error::LogResult;
use crate::layout::{id_to_offset, magic_word, offset_to_id, round_up, EntryLayout, Slot};
use crate::mapped::Page;

/// Size of a record header in bytes.
pub const RECORD_HEADER_SIZE: u32 = 4;

/// Record alignment, which is also the record id granularity.
pub const RECORD_ALIGNMENT: u64 = 4;

/// Largest page size a record log accepts (512 MiB), bounded by the 30-bit
/// length field.
pub const RECORD_MAX_PAGE_SIZE: u32 = 1 << 29;

const PADDING_FLAG: u32 = 1 << 31;
const COMMITTED_FLAG: u32 = 1 << 30;
const LENGTH_MASK: u32 = COMMITTED_FLAG - 1;

/// Header of a data record holding `payload_len` bytes.
pub(crate) fn data_header(payload_len: u32, committed: bool) -> u32 {
    let header = payload_len + RECORD_HEADER_SIZE;
    debug_assert!(header <= LENGTH_MASK, "record length {header} overflows the header");
    if committed {
        header | COMMITTED_FLAG
    } else {
        header
    }
}

/// Header of a padding record spanning `length` bytes.
pub(crate) fn padding_header(length: u32) -> u32 {
    debug_assert!(length <= LENGTH_MASK, "padding length {length} overflows the header");
    length | PADDING_FLAG | COMMITTED_FLAG
}

/// Decodes a raw record header.
pub(crate) fn decode_header(header: u32) -> Slot {
    if header == 0 {
        return Slot::Unset;
    }
    let length = header & LENGTH_MASK;
    if length < RECORD_HEADER_SIZE {
        return Slot::Invalid {
            raw: u64::from(header),
        };
    }
    if header & PADDING_FLAG != 0 {
        if u64::from(length) % RECORD_ALIGNMENT != 0 {
            return Slot::Invalid {
                raw: u64::from(header),
            };
        }
        return Slot::Padding { length };
    }
    Slot::Data {
        length: round_up(u64::from(length), RECORD_ALIGNMENT) as u32,
        payload_len: length - RECORD_HEADER_SIZE,
        finished: header & COMMITTED_FLAG != 0,
    }
}

/// Converts a record id into the file offset of its header.
///
/// Rejects non-positive ids and ids whose offset overflows. Every offset this
/// returns converts back to the same id through [`record_offset_to_id`].
pub fn record_id_to_offset(record_id: i64) -> LogResult<u64> {
    id_to_offset(record_id, RECORD_ALIGNMENT)
}

/// Converts the file offset of a record header into its id.
///
/// Rejects offsets inside the file header and unaligned offsets.
pub fn record_offset_to_id(offset: u64) -> LogResult<i64> {
    offset_to_id(offset, RECORD_ALIGNMENT)
}

/// Record codec plugged into the shared region code.
pub(crate) struct RecordLayout;

impl RecordLayout {
    pub(crate) fn store_header(page: &Page, offset: usize, header: u32) {
        page.atomic_u32(offset).store(header, Ordering::Release);
    }
}

impl EntryLayout for RecordLayout {
    const KIND: &'static str = "record log";
    const MAGIC_WORD: u32 = magic_word(b"AOLM");
    const IMPLEMENTATION_VERSION: u32 = 2;
    const ALIGNMENT: u64 = RECORD_ALIGNMENT;
    const HEADER_SIZE: u32 = RECORD_HEADER_SIZE;
    const MAX_PAGE_SIZE: u32 = RECORD_MAX_PAGE_SIZE;

    fn read_slot(page: &Page, offset: usize) -> Slot {
        decode_header(page.atomic_u32(offset).load(Ordering::Acquire))
    }

    fn raw_header(page: &Page, offset: usize) -> u64 {
        u64::from(page.atomic_u32(offset).load(Ordering::Acquire))
    }

    fn put_padding(page: &Page, offset: usize, length: u32) {
        Self::store_header(page, offset, padding_header(length));
    }
}
