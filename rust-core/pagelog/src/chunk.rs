// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Chunk codec and chunk handle
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A chunk is a 64-bit header followed by its reserved capacity, padded to
// 8 bytes. Besides the chunk length the header carries two cursors into the
// capacity, so appends into a chunk need nothing but a compare-and-swap on
// the header word:
//
// ```text
// bit  63      : padding flag
// bits 42..=62 : chunk length / 8 (header included)
// bits 21..=41 : committed cursor (bytes readable by `read()`)
// bits 0..=20  : allocated cursor (bytes reserved by appenders)
// ```
//
// An append reserves `[allocated, allocated + size)` by advancing the
// allocated cursor, lets the caller fill the range, then waits until the
// committed cursor reaches the start of its range and advances it past the
// range. The committed cursor therefore only ever covers completely written
// bytes, in reservation order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::error::LogResult;
use crate::layout::{id_to_offset, magic_word, offset_to_id, EntryLayout, Slot};
use crate::mapped::Page;

/// Size of a chunk header in bytes.
pub const CHUNK_HEADER_SIZE: u32 = 8;

/// Chunk alignment, which is also the chunk id granularity.
pub const CHUNK_ALIGNMENT: u64 = 8;

/// Largest page size a chunk log accepts (2 MiB), bounded by the 21-bit
/// cursors.
pub const CHUNK_MAX_PAGE_SIZE: u32 = 1 << 21;

const PADDING_FLAG: u64 = 1 << 63;
const FIELD_BITS: u32 = 21;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;
const COMMITTED_SHIFT: u32 = FIELD_BITS;
const LENGTH_SHIFT: u32 = 2 * FIELD_BITS;

const SPINS_BEFORE_YIELD: u32 = 64;

fn pack(length: u32, committed: u32, allocated: u32) -> u64 {
    debug_assert_eq!(u64::from(length) % CHUNK_ALIGNMENT, 0);
    ((u64::from(length) / CHUNK_ALIGNMENT) << LENGTH_SHIFT)
        | (u64::from(committed) << COMMITTED_SHIFT)
        | u64::from(allocated)
}

fn allocated_of(header: u64) -> u32 {
    (header & FIELD_MASK) as u32
}

fn committed_of(header: u64) -> u32 {
    ((header >> COMMITTED_SHIFT) & FIELD_MASK) as u32
}

fn with_allocated(header: u64, allocated: u32) -> u64 {
    (header & !FIELD_MASK) | u64::from(allocated)
}

fn with_committed(header: u64, committed: u32) -> u64 {
    (header & !(FIELD_MASK << COMMITTED_SHIFT)) | (u64::from(committed) << COMMITTED_SHIFT)
}

/// Decodes a raw chunk header.
pub(crate) fn decode_header(header: u64) -> Slot {
    if header == 0 {
        return Slot::Unset;
    }
    let length = ((header >> LENGTH_SHIFT) & FIELD_MASK) * CHUNK_ALIGNMENT;
    if length < u64::from(CHUNK_HEADER_SIZE) {
        return Slot::Invalid { raw: header };
    }
    let length = length as u32;
    if header & PADDING_FLAG != 0 {
        return Slot::Padding { length };
    }
    let capacity = length - CHUNK_HEADER_SIZE;
    let (committed, allocated) = (committed_of(header), allocated_of(header));
    if allocated > capacity || committed > allocated {
        return Slot::Invalid { raw: header };
    }
    Slot::Data {
        length,
        payload_len: capacity,
        finished: true,
    }
}

/// Converts a chunk id into the file offset of its header.
pub fn chunk_id_to_offset(chunk_id: i64) -> LogResult<u64> {
    id_to_offset(chunk_id, CHUNK_ALIGNMENT)
}

/// Converts the file offset of a chunk header into its id.
pub fn chunk_offset_to_id(offset: u64) -> LogResult<i64> {
    offset_to_id(offset, CHUNK_ALIGNMENT)
}

/// Chunk codec plugged into the shared region code.
pub(crate) struct ChunkLayout;

impl ChunkLayout {
    /// Publishes the header of a freshly reserved chunk of `length` bytes.
    pub(crate) fn put_chunk(page: &Page, offset: usize, length: u32) {
        page.atomic_u64(offset)
            .store(pack(length, 0, 0), Ordering::Release);
    }
}

impl EntryLayout for ChunkLayout {
    const KIND: &'static str = "chunk log";
    const MAGIC_WORD: u32 = magic_word(b"AOLC");
    const IMPLEMENTATION_VERSION: u32 = 1;
    const ALIGNMENT: u64 = CHUNK_ALIGNMENT;
    const HEADER_SIZE: u32 = CHUNK_HEADER_SIZE;
    const MAX_PAGE_SIZE: u32 = CHUNK_MAX_PAGE_SIZE;

    fn read_slot(page: &Page, offset: usize) -> Slot {
        decode_header(Self::raw_header(page, offset))
    }

    fn raw_header(page: &Page, offset: usize) -> u64 {
        page.atomic_u64(offset).load(Ordering::Acquire)
    }

    fn put_padding(page: &Page, offset: usize, length: u32) {
        page.atomic_u64(offset)
            .store(pack(length, 0, 0) | PADDING_FLAG, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Handle to one chunk of a [`ChunkedLog`](crate::ChunkedLog).
///
/// Handles are cheap to clone and may be shared between threads; every
/// clone appends into the same reserved space. A handle keeps the page it
/// lives on mapped.
#[derive(Clone)]
pub struct Chunk {
    page: Arc<Page>,
    id: i64,
    offset_in_page: usize,
    capacity: u32,
    flush_on_append: bool,
}

impl Chunk {
    pub(crate) fn new(
        page: Arc<Page>,
        id: i64,
        offset_in_page: usize,
        capacity: u32,
        flush_on_append: bool,
    ) -> Self {
        Self {
            page,
            id,
            offset_in_page,
            capacity,
            flush_on_append,
        }
    }

    fn header(&self) -> &AtomicU64 {
        self.page.atomic_u64(self.offset_in_page)
    }

    fn data_offset(&self) -> usize {
        self.offset_in_page + CHUNK_HEADER_SIZE as usize
    }

    /// The chunk id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Reserved capacity in bytes; at least what was requested.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes appended and published so far.
    pub fn len(&self) -> u32 {
        committed_of(self.header().load(Ordering::Acquire))
    }

    /// True if nothing has been published yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes still available for appends.
    pub fn remaining(&self) -> u32 {
        self.capacity - allocated_of(self.header().load(Ordering::Acquire))
    }

    /// True once the whole capacity has been reserved by appends.
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Appends `size` bytes produced by `writer`.
    ///
    /// Returns `false`, without calling `writer` or changing anything, if
    /// fewer than `size` bytes remain. Otherwise `writer` receives exactly
    /// the reserved range, which no other appender can touch. The range is
    /// published to readers after `writer` returns (or panics), once every
    /// range reserved before it has been published.
    pub fn append(&self, size: u32, writer: impl FnOnce(&mut [u8])) -> bool {
        let header = self.header();
        let mut current = header.load(Ordering::Acquire);
        let start = loop {
            let start = allocated_of(current);
            let end = u64::from(start) + u64::from(size);
            if end > u64::from(self.capacity) {
                return false;
            }
            if size == 0 {
                return true;
            }
            match header.compare_exchange_weak(
                current,
                with_allocated(current, end as u32),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break start,
                Err(actual) => current = actual,
            }
        };

        let publish = Publish {
            chunk: self,
            start,
            size,
        };
        let offset = self.data_offset() + start as usize;
        // SAFETY: the compare-and-swap above handed [start, start + size) to
        // this call alone, and readers only look below the committed cursor,
        // which does not pass `start` before `publish` is dropped.
        writer(unsafe { self.page.bytes_mut(offset, size as usize) });
        drop(publish);

        if self.flush_on_append {
            if let Err(error) = self.page.flush_range(offset, size as usize) {
                warn!(chunk = self.id, %error, "Failed to flush chunk append");
            }
        }
        true
    }

    /// Appends a copy of `bytes`; see [`Chunk::append`].
    pub fn append_bytes(&self, bytes: &[u8]) -> bool {
        match u32::try_from(bytes.len()) {
            Ok(size) => self.append(size, |buffer| buffer.copy_from_slice(bytes)),
            Err(_) => false,
        }
    }

    /// The published content, `[0, len())`.
    pub fn read(&self) -> &[u8] {
        let committed = self.len() as usize;
        // SAFETY: bytes below the committed cursor are fully written and no
        // appender writes below the cursor again.
        unsafe { self.page.bytes(self.data_offset(), committed) }
    }

    /// Copies the published content.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read().to_vec()
    }

    /// Drops reservations that were never published: used on open after an
    /// unclean shutdown, before the chunk is shared. Returns true if anything
    /// was rolled back.
    pub(crate) fn roll_back_unpublished(&self) -> bool {
        let header = self.header();
        let current = header.load(Ordering::Acquire);
        let (committed, allocated) = (committed_of(current), allocated_of(current));
        if allocated == committed {
            return false;
        }
        // SAFETY: only called while opening, when no other handle exists.
        unsafe {
            self.page.zero(
                self.data_offset() + committed as usize,
                (allocated - committed) as usize,
            )
        };
        header.store(with_allocated(current, committed), Ordering::Release);
        true
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.header().load(Ordering::Acquire);
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("allocated", &allocated_of(header))
            .field("committed", &committed_of(header))
            .finish()
    }
}

/// Publishes a reserved range on drop, including during unwinding, so a
/// panicking writer can not stall later appenders.
struct Publish<'a> {
    chunk: &'a Chunk,
    start: u32,
    size: u32,
}

impl Drop for Publish<'_> {
    fn drop(&mut self) {
        let header = self.chunk.header();
        let mut spins = 0u32;
        let mut current = header.load(Ordering::Acquire);
        loop {
            if committed_of(current) == self.start {
                let next = with_committed(current, self.start + self.size);
                match header.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return,
                    Err(actual) => {
                        current = actual;
                        continue;
                    }
                }
            }
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
            spins = spins.saturating_add(1);
            current = header.load(Ordering::Acquire);
        }
    }
}
