// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Chunked append-only log
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `ChunkedLog` hands out chunks: fixed-capacity regions reserved at the tail
// of the log that are filled afterwards by any number of `Chunk::append`
// calls, possibly from several threads at once. The chunk header is
// published as soon as the space is reserved, so chunk ids are usable (and
// visible to scans) before anything is written into them.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkLayout, CHUNK_ALIGNMENT, CHUNK_HEADER_SIZE};
use crate::config::{LogConfig, SyncMode};
use crate::error::{LogError, LogResult};
use crate::layout::{round_up, Slot};
use crate::recovery::RecoveryInfo;
use crate::region::{Located, Region};

/// Memory-mapped log of chunks with reserved capacity.
pub struct ChunkedLog {
    region: Region<ChunkLayout>,
}

impl ChunkedLog {
    /// Opens the chunk log at `path`, creating it if necessary.
    ///
    /// After an unclean shutdown, appends that reserved space inside a chunk
    /// but never published it are rolled back.
    pub fn open(path: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let region = Region::open(path, config)?;
        let mut log = Self { region };
        if !log.region.recovery().was_closed_properly() {
            log.roll_back_unpublished_appends()?;
        }
        info!(
            path = %log.region.path().display(),
            chunks = log.region.entry_count(),
            page_size = log.region.page_size(),
            "Opened chunked log"
        );
        Ok(log)
    }

    fn roll_back_unpublished_appends(&mut self) -> LogResult<()> {
        let mut rolled_back = 0u64;
        self.region.scan(self.region.committed(), |located| {
            if let Some(chunk) = self.chunk_at(located)? {
                if chunk.roll_back_unpublished() {
                    debug!(chunk = chunk.id(), "Rolled back unpublished chunk append");
                    rolled_back += 1;
                }
            }
            Ok(true)
        })?;
        if rolled_back > 0 {
            warn!(
                path = %self.region.path().display(),
                chunks = rolled_back,
                "Rolled back unpublished chunk appends"
            );
            self.region.recovery_mut().note_rolled_back_chunks(rolled_back);
        }
        Ok(())
    }

    fn chunk_at(&self, located: &Located) -> LogResult<Option<Chunk>> {
        let Slot::Data { length, .. } = located.slot else {
            return Ok(None);
        };
        Ok(Some(Chunk::new(
            located.page.clone(),
            self.region.id_of(located.offset)?,
            located.offset_in_page,
            length - CHUNK_HEADER_SIZE,
            self.flush_on_append(),
        )))
    }

    fn flush_on_append(&self) -> bool {
        self.region.config().sync_mode == SyncMode::Fsync
    }

    // -----------------------------------------------------------------------
    // Appending
    // -----------------------------------------------------------------------

    /// Reserves a chunk that can hold at least `capacity` bytes.
    ///
    /// The capacity is rounded up so the chunk ends on an 8-byte boundary.
    /// Fails with [`LogError::InvalidCapacity`] for zero and with
    /// [`LogError::PayloadTooLarge`] above [`ChunkedLog::max_payload_size`].
    pub fn append(&self, capacity: u32) -> LogResult<Chunk> {
        if capacity == 0 {
            return Err(LogError::InvalidCapacity(capacity));
        }
        self.region.check_payload_size(u64::from(capacity))?;
        let length =
            round_up(u64::from(capacity) + u64::from(CHUNK_HEADER_SIZE), CHUNK_ALIGNMENT) as u32;

        let (offset, page) = self.region.allocate(length)?;
        let in_page = self.region.storage().offset_in_page(offset);
        ChunkLayout::put_chunk(&page, in_page, length);
        self.region.try_commit()?;
        self.region
            .after_write(offset, u64::from(CHUNK_HEADER_SIZE))?;

        let id = self.region.id_of(offset)?;
        debug!(id, offset, capacity, reserved = length - CHUNK_HEADER_SIZE, "Reserved chunk");
        Ok(Chunk::new(
            page,
            id,
            in_page,
            length - CHUNK_HEADER_SIZE,
            self.flush_on_append(),
        ))
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Returns a handle to chunk `id`.
    ///
    /// `id` must come from [`Chunk::id`]. An id that lands inside another
    /// chunk decodes that chunk's bytes as a header, and the handle it yields
    /// would append over them. Enable
    /// [`LogConfig::with_entry_boundary_verification`] to reject such ids with
    /// [`LogError::NotAnEntry`].
    pub fn read(&self, id: i64) -> LogResult<Chunk> {
        let located = self.region.locate(id)?;
        match self.chunk_at(&located)? {
            Some(chunk) => Ok(chunk),
            // Reserved, header not published yet.
            None => Err(LogError::NotCommitted {
                id,
                offset: located.offset,
                header: 0,
            }),
        }
    }

    /// Visits every chunk in id order, empty chunks included.
    ///
    /// Returns `Ok(false)` if `visitor` stopped the walk by returning false.
    pub fn for_each_chunk(&self, mut visitor: impl FnMut(&Chunk) -> bool) -> LogResult<bool> {
        self.region.scan(self.region.committed(), |located| {
            Ok(match self.chunk_at(located)? {
                Some(chunk) => visitor(&chunk),
                None => true,
            })
        })
    }

    /// True if `id` points at a chunk.
    pub fn is_valid_id(&self, id: i64) -> bool {
        matches!(
            self.region.locate(id),
            Ok(Located {
                slot: Slot::Data { .. },
                ..
            })
        )
    }

    /// Hex dump of the file around chunk `id`, for diagnostics.
    pub fn dump_around(&self, id: i64, width: u64) -> LogResult<String> {
        let offset = crate::chunk::chunk_id_to_offset(id)?;
        let allocated = self.region.allocated();
        if offset >= allocated {
            return Err(LogError::IdOutOfRange {
                id,
                offset,
                allocated_up_to: allocated,
                diagnostics: self.region.recovery().diagnostics(),
            });
        }
        self.region.dump_around(offset, width)
    }

    // -----------------------------------------------------------------------
    // Header and state
    // -----------------------------------------------------------------------

    /// Number of chunks reserved and published.
    pub fn chunks_count(&self) -> u64 {
        self.region.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Largest capacity a single chunk can have.
    pub fn max_payload_size(&self) -> u32 {
        self.region.max_payload_size()
    }

    pub fn page_size(&self) -> u32 {
        self.region.page_size()
    }

    pub fn config(&self) -> &LogConfig {
        self.region.config()
    }

    pub fn data_version(&self) -> u32 {
        self.region.header().data_version()
    }

    pub fn set_data_version(&self, version: u32) {
        self.region.header().set_data_version(version);
    }

    pub fn user_header_field(&self, field: usize) -> LogResult<u32> {
        Ok(self.region.header().user_field(field)?.load(Ordering::Acquire))
    }

    pub fn set_user_header_field(&self, field: usize, value: u32) -> LogResult<()> {
        self.region
            .header()
            .user_field(field)?
            .store(value, Ordering::Release);
        Ok(())
    }

    pub fn recovery_info(&self) -> &RecoveryInfo {
        self.region.recovery()
    }

    pub fn was_recovery_needed(&self) -> bool {
        self.region.recovery().was_recovery_needed()
    }

    pub fn was_closed_properly(&self) -> bool {
        self.region.recovery().was_closed_properly()
    }

    pub fn recovered_region(&self) -> Option<std::ops::Range<u64>> {
        self.region.recovery().recovered_region()
    }

    pub fn storage_path(&self) -> &Path {
        self.region.path()
    }

    /// Flushes all chunks and the header to disk.
    pub fn sync(&self) -> LogResult<()> {
        self.region.sync()
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Flushes, marks the file as closed cleanly and releases it.
    ///
    /// Outstanding [`Chunk`] handles keep their pages mapped but must not
    /// be appended to afterwards; the file may already be closed.
    pub fn close(self) -> LogResult<PathBuf> {
        let chunks = self.chunks_count();
        let path = self.region.close()?;
        info!(path = %path.display(), chunks, "Closed chunked log");
        Ok(path)
    }

    /// Closes the log and deletes its file.
    pub fn close_and_remove(self) -> LogResult<PathBuf> {
        let path = self.region.close_and_remove()?;
        info!(path = %path.display(), "Closed and removed chunked log");
        Ok(path)
    }
}

impl std::fmt::Debug for ChunkedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedLog")
            .field("path", &self.region.path())
            .field("page_size", &self.region.page_size())
            .field("chunks", &self.region.entry_count())
            .finish()
    }
}
