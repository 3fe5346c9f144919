// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Memory-mapped append-only logs
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persists variable-length binary entries to a single file that is accessed
// through fixed-size memory-mapped pages. Every entry gets a stable 64-bit
// id derived from its file offset, so ids survive restarts without an index.
//
// # Architecture
//
// Two log kinds share one file format and one allocation scheme:
//
// - `AppendOnlyLog` stores immutable records, written once by `append`;
// - `ChunkedLog` reserves chunks of a requested capacity, which are then
//   filled by any number of concurrent `Chunk::append` calls.
//
// Appenders never take a lock. Space is reserved with a compare-and-swap on
// an allocation cursor stored in the mapped file header, and a second
// cursor marks the end of the contiguous prefix of finished entries. No
// entry crosses a page boundary: when the current page is too short, its
// tail becomes a padding entry.
//
// ## File header (64 bytes, native byte order)
//
// ```text
// [ 0.. 4] magic word ("AOLM" records, "AOLC" chunks)
// [ 4.. 8] implementation version
// [ 8..12] data version (caller defined)
// [12..16] page size
// [16..24] next offset to allocate
// [24..32] next offset to commit
// [32..40] entry count
// [40..44] status (1 = open, 0 = closed cleanly)
// [44..64] five caller defined u32 fields
// ```
//
// ## Entries
//
// ```text
// record: [u32 header: padding | committed | length (30 bits)][payload]      4-byte aligned
// chunk:  [u64 header: padding | length/8 | committed | allocated][capacity] 8-byte aligned
// ```
//
// Record ids are `(offset - 64) / 4 + 1`, chunk ids `(offset - 64) / 8 + 1`.
//
// ## Usage
//
// ```no_run
// use pagelog::{AppendOnlyLog, ChunkedLog, LogConfig};
//
// let log = AppendOnlyLog::open("/tmp/pagelog/records.log", LogConfig::default()).unwrap();
// let id = log.append(b"test data").unwrap();
// assert_eq!(log.read_to_vec(id).unwrap(), b"test data");
// log.close().unwrap();
//
// let chunks = ChunkedLog::open("/tmp/pagelog/chunks.log", LogConfig::default()).unwrap();
// let chunk = chunks.append(1024).unwrap();
// chunk.append_bytes(b"first part, ");
// chunk.append_bytes(b"second part");
// assert_eq!(chunks.read(chunk.id()).unwrap().read(), b"first part, second part");
// ```

pub mod chunk;
pub mod chunked;
pub mod config;
pub mod error;
pub mod layout;
pub mod log;
pub mod mapped;
pub mod paged;
pub mod record;
pub mod recovery;
mod region;

// Re-export the primary public API for ergonomic imports.
pub use chunk::{
    chunk_id_to_offset, chunk_offset_to_id, Chunk, CHUNK_HEADER_SIZE, CHUNK_MAX_PAGE_SIZE,
};
pub use chunked::ChunkedLog;
pub use config::{FormatCheck, LogConfig, SyncMode, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
pub use error::{LogError, LogResult};
pub use layout::{magic_word, HeaderSnapshot, FILE_HEADER_SIZE, USER_HEADER_FIELDS};
pub use log::AppendOnlyLog;
pub use mapped::{MappedFile, Page};
pub use paged::{detect_kind, LogKind, PagedLog};
pub use record::{
    record_id_to_offset, record_offset_to_id, RECORD_HEADER_SIZE, RECORD_MAX_PAGE_SIZE,
};
pub use recovery::RecoveryInfo;
