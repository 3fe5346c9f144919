// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Entry region shared by both log kinds
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `Region` is everything a log needs except the meaning of its entries:
// opening and validating the file header, reserving space at the tail with a
// compare-and-swap on the allocation cursor (padding page tails on the way),
// advancing the commit cursor over finished entries, and walking entries in
// file order. The record and chunk logs wrap a `Region` parameterised by
// their `EntryLayout`.
//
// Two cursors live in the file header:
//
// ```text
//   FILE_HEADER_SIZE        committed                allocated
//   |  finished entries ... |  entries being written  |  zeroes ...
// ```
//
// Entries below `committed` are complete and immutable. Between the cursors,
// entries may still be in the hands of their writers.

use std::fmt::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{FormatCheck, LogConfig, SyncMode};
use crate::error::{LogError, LogResult};
use crate::layout::{
    id_to_offset, offset_to_id, EntryLayout, FileHeader, HeaderSnapshot, Slot,
    FILE_HEADER_SIZE, STATUS_CLOSED, STATUS_OPENED,
};
use crate::mapped::{MappedFile, Page};
use crate::recovery::RecoveryInfo;

/// How many times a boundary walk waits for an in-flight header before it
/// gives up.
const UNSET_HEADER_RETRIES: u32 = 1024;

/// A located entry: its file offset, page and position within the page.
pub(crate) struct Located {
    pub(crate) offset: u64,
    pub(crate) page: Arc<Page>,
    pub(crate) offset_in_page: usize,
    pub(crate) slot: Slot,
}

pub(crate) struct Region<L: EntryLayout> {
    storage: MappedFile,
    header: FileHeader,
    config: LogConfig,
    recovery: RecoveryInfo,
    last_sync: Mutex<Instant>,
    _layout: PhantomData<L>,
}

impl<L: EntryLayout> Region<L> {
    /// Opens (or creates) the file, validates its header, recovers in-flight
    /// entries and recounts entries.
    pub(crate) fn open(path: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let path = path.as_ref();
        config.validate(L::MAX_PAGE_SIZE)?;
        let config = Self::adopt_file_page_size(path, config)?;
        let storage = MappedFile::open(path, config.page_size)?;
        let header = FileHeader::new(storage.page(0)?);

        let fresh = header.magic_word() == 0
            && header.allocated().load(Ordering::Acquire) == 0;
        if fresh {
            header.initialize(L::MAGIC_WORD, L::IMPLEMENTATION_VERSION, config.page_size);
            info!(
                path = %storage.path().display(),
                kind = L::KIND,
                page_size = config.page_size,
                "Created log file"
            );
        } else {
            Self::check_format(&storage, &header, &config)?;
        }

        let was_closed_properly = header.status() == STATUS_CLOSED;
        if !was_closed_properly {
            warn!(path = %storage.path().display(), "Log file was not closed properly");
        }
        header.set_status(STATUS_OPENED);
        header.flush()?;

        let mut region = Self {
            storage,
            header,
            config,
            recovery: RecoveryInfo::new(was_closed_properly),
            last_sync: Mutex::new(Instant::now()),
            _layout: PhantomData,
        };
        region.recover_in_flight_entries()?;
        region.recount_entries()?;
        Ok(region)
    }

    /// Under `FormatCheck::Ignore`, an existing file of this kind keeps the
    /// page size it was written with; entries never straddle its page seams.
    fn adopt_file_page_size(path: &Path, config: LogConfig) -> LogResult<LogConfig> {
        if config.format_check != FormatCheck::Ignore {
            return Ok(config);
        }
        let file_page_size = match HeaderSnapshot::read(path)? {
            Some(snapshot)
                if snapshot.magic_word == L::MAGIC_WORD && snapshot.page_size != config.page_size =>
            {
                snapshot.page_size
            }
            _ => return Ok(config),
        };
        warn!(
            path = %path.display(),
            file_page_size,
            page_size = config.page_size,
            "Ignoring page size mismatch, using the file's page size"
        );
        let config = config.with_page_size(file_page_size);
        config.validate(L::MAX_PAGE_SIZE)?;
        Ok(config)
    }

    fn check_format(storage: &MappedFile, header: &FileHeader, config: &LogConfig) -> LogResult<()> {
        let path = storage.path().display().to_string();

        let magic = header.magic_word();
        if magic != L::MAGIC_WORD {
            return Err(LogError::MagicMismatch {
                path,
                expected: L::KIND,
                found: magic,
            });
        }

        let version = header.implementation_version();
        if version != L::IMPLEMENTATION_VERSION {
            if config.format_check == FormatCheck::Strict {
                return Err(LogError::UnsupportedVersion {
                    path,
                    found: version,
                    supported: L::IMPLEMENTATION_VERSION,
                });
            }
            warn!(path = %path, found = version, "Ignoring implementation version mismatch");
        }

        // A mismatch left at this point is never ignored: the mapping would
        // not match the file's layout.
        let file_page_size = header.page_size();
        if file_page_size != config.page_size {
            return Err(LogError::PageSizeMismatch {
                path,
                file_page_size,
                page_size: config.page_size,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub(crate) fn path(&self) -> &Path {
        self.storage.path()
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.storage.page_size()
    }

    pub(crate) fn config(&self) -> &LogConfig {
        &self.config
    }

    pub(crate) fn header(&self) -> &FileHeader {
        &self.header
    }

    pub(crate) fn storage(&self) -> &MappedFile {
        &self.storage
    }

    pub(crate) fn recovery(&self) -> &RecoveryInfo {
        &self.recovery
    }

    pub(crate) fn recovery_mut(&mut self) -> &mut RecoveryInfo {
        &mut self.recovery
    }

    /// Largest payload one entry can carry.
    pub(crate) fn max_payload_size(&self) -> u32 {
        self.page_size() - L::HEADER_SIZE
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.header.allocated().load(Ordering::Acquire)
    }

    pub(crate) fn committed(&self) -> u64 {
        self.header.committed().load(Ordering::Acquire)
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.header.entry_count().load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.allocated() == FILE_HEADER_SIZE
    }

    pub(crate) fn path_string(&self) -> String {
        self.path().display().to_string()
    }

    // -----------------------------------------------------------------------
    // Appending
    // -----------------------------------------------------------------------

    /// Checks that a payload of `size` bytes fits a page.
    pub(crate) fn check_payload_size(&self, size: u64) -> LogResult<()> {
        let max = self.max_payload_size();
        if size > u64::from(max) {
            return Err(LogError::PayloadTooLarge {
                size,
                max,
                page_size: self.page_size(),
            });
        }
        Ok(())
    }

    /// Reserves `length` bytes (header included, aligned) at the tail.
    ///
    /// If the current page can not hold the entry, its tail is turned into a
    /// padding entry and the reservation moves to the next page. The page is
    /// mapped before the cursor moves, so a failure to grow the file leaves
    /// no reservation behind.
    pub(crate) fn allocate(&self, length: u32) -> LogResult<(u64, Arc<Page>)> {
        debug_assert_eq!(u64::from(length) % L::ALIGNMENT, 0);
        debug_assert!(length <= self.page_size());

        let page_size = u64::from(self.page_size());
        let allocated = self.header.allocated();
        loop {
            let offset = allocated.load(Ordering::Acquire);
            let page = self.storage.page_by_offset(offset)?;
            let in_page = offset & (page_size - 1);
            let remaining = page_size - in_page;

            if u64::from(length) <= remaining {
                if allocated
                    .compare_exchange_weak(
                        offset,
                        offset + u64::from(length),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok((offset, page));
                }
                continue;
            }

            debug_assert!(remaining >= u64::from(L::HEADER_SIZE));
            if allocated
                .compare_exchange_weak(offset, offset + remaining, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                L::put_padding(&page, in_page as usize, remaining as u32);
                debug!(offset, length = remaining, "Padded page tail");
                self.try_commit()?;
            }
        }
    }

    /// Moves the commit cursor over every finished entry that directly
    /// follows it, and adds the data entries passed over to the count.
    pub(crate) fn try_commit(&self) -> LogResult<()> {
        // Pairs with the fence of every other committer: of two writers that
        // each publish a header and then look at the other's, at least one
        // sees both, so the cursor never stalls behind a finished entry.
        fence(Ordering::SeqCst);
        let committed = self.header.committed();
        loop {
            let start = committed.load(Ordering::Acquire);
            let limit = self.allocated();
            let mut cursor = start;
            let mut data_entries = 0u64;
            while cursor < limit {
                let page = self.storage.page_by_offset(cursor)?;
                match self.slot_at(&page, self.storage.offset_in_page(cursor)) {
                    Slot::Padding { length } => cursor += u64::from(length),
                    Slot::Data {
                        length,
                        finished: true,
                        ..
                    } => {
                        data_entries += 1;
                        cursor += u64::from(length);
                    }
                    _ => break,
                }
            }
            if cursor == start {
                return Ok(());
            }
            if committed
                .compare_exchange(start, cursor, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.header
                    .entry_count()
                    .fetch_add(data_entries, Ordering::AcqRel);
                return Ok(());
            }
        }
    }

    /// Flushes according to the configured sync mode after `[offset,
    /// offset + length)` was written.
    pub(crate) fn after_write(&self, offset: u64, length: u64) -> LogResult<()> {
        match &self.config.sync_mode {
            SyncMode::Fsync => {
                self.storage.flush_range(offset, length)?;
                self.header.flush()?;
            }
            SyncMode::Periodic(interval) => {
                let mut last_sync = self.last_sync.lock();
                if last_sync.elapsed() >= *interval {
                    self.storage.flush()?;
                    *last_sync = Instant::now();
                    debug!(path = %self.path().display(), "Periodic sync");
                }
            }
            SyncMode::Async => {}
        }
        Ok(())
    }

    /// Flushes everything regardless of the sync mode.
    pub(crate) fn sync(&self) -> LogResult<()> {
        self.storage.flush()?;
        *self.last_sync.lock() = Instant::now();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Decodes the header at `in_page`, rejecting entries that would cross
    /// the end of the page.
    pub(crate) fn slot_at(&self, page: &Page, in_page: usize) -> Slot {
        let slot = L::read_slot(page, in_page);
        match slot.length() {
            Some(length) if in_page + length as usize > page.len() => Slot::Invalid {
                raw: L::raw_header(page, in_page),
            },
            _ => slot,
        }
    }

    pub(crate) fn id_of(&self, offset: u64) -> LogResult<i64> {
        offset_to_id(offset, L::ALIGNMENT)
    }

    /// Finds the entry an id points at. Padding and corrupted headers are
    /// rejected; unset and unfinished entries are returned as found.
    pub(crate) fn locate(&self, id: i64) -> LogResult<Located> {
        let offset = id_to_offset(id, L::ALIGNMENT)?;
        let allocated = self.allocated();
        if offset >= allocated {
            return Err(LogError::IdOutOfRange {
                id,
                offset,
                allocated_up_to: allocated,
                diagnostics: self.recovery.diagnostics(),
            });
        }
        if self.config.verify_entry_boundaries && !self.is_entry_boundary(offset)? {
            return Err(LogError::NotAnEntry { id, offset });
        }

        let page = self.storage.page_by_offset(offset)?;
        let offset_in_page = self.storage.offset_in_page(offset);
        let slot = self.slot_at(&page, offset_in_page);
        match slot {
            Slot::Padding { .. } => Err(LogError::PaddingEntry { id, offset }),
            Slot::Invalid { raw } => Err(self.corrupted(
                offset,
                format!("id {id} points at undecodable header {raw:#x}"),
            )),
            Slot::Unset | Slot::Data { .. } => Ok(Located {
                offset,
                page,
                offset_in_page,
                slot,
            }),
        }
    }

    /// Walks the page containing `offset` from its first entry and reports
    /// whether some entry starts exactly at `offset`.
    pub(crate) fn is_entry_boundary(&self, offset: u64) -> LogResult<bool> {
        let page_start = offset & !(u64::from(self.page_size()) - 1);
        let mut cursor = page_start.max(FILE_HEADER_SIZE);
        let page = self.storage.page_by_offset(offset)?;
        let mut retries = 0;
        while cursor < offset {
            let slot = self.slot_at(&page, self.storage.offset_in_page(cursor));
            match slot.length() {
                Some(length) => cursor += u64::from(length),
                // A writer that reserved space has not published its header
                // yet; it does so right after the reservation.
                None if slot == Slot::Unset && retries < UNSET_HEADER_RETRIES => {
                    retries += 1;
                    std::thread::yield_now();
                }
                None => return Ok(false),
            }
        }
        Ok(cursor == offset)
    }

    /// Visits the entries in `[FILE_HEADER_SIZE, until)` in file order,
    /// padding included. Stops early, returning `false`, when the visitor
    /// does. A missing or undecodable header inside the range is corruption.
    pub(crate) fn scan(
        &self,
        until: u64,
        mut visitor: impl FnMut(&Located) -> LogResult<bool>,
    ) -> LogResult<bool> {
        let mut offset = FILE_HEADER_SIZE;
        while offset < until {
            let page = self.storage.page_by_offset(offset)?;
            let offset_in_page = self.storage.offset_in_page(offset);
            let slot = self.slot_at(&page, offset_in_page);
            let length = match slot {
                Slot::Padding { length } | Slot::Data { length, .. } => length,
                Slot::Unset => {
                    return Err(self.corrupted(offset, "missing header inside the committed region".to_string()))
                }
                Slot::Invalid { raw } => {
                    return Err(self.corrupted(offset, format!("undecodable header {raw:#x}")))
                }
            };
            let located = Located {
                offset,
                page,
                offset_in_page,
                slot,
            };
            if !visitor(&located)? {
                return Ok(false);
            }
            offset += u64::from(length);
        }
        Ok(true)
    }

    pub(crate) fn corrupted(&self, offset: u64, detail: String) -> LogError {
        LogError::Corrupted {
            path: self.path_string(),
            offset,
            detail,
            diagnostics: self.recovery.diagnostics(),
        }
    }

    /// Hex dump of the 32-bit words around `offset`, within its page.
    pub(crate) fn dump_around(&self, offset: u64, width: u64) -> LogResult<String> {
        let page = self.storage.page_by_offset(offset)?;
        let page_start = offset - self.storage.offset_in_page(offset) as u64;
        let from = offset.saturating_sub(width).max(page_start) & !3;
        let to = offset
            .saturating_add(width)
            .min(page_start + u64::from(self.page_size()));

        let mut dump = String::new();
        let mut word = from;
        while word + 4 <= to {
            if (word - from) % 32 == 0 {
                if word != from {
                    dump.push('\n');
                }
                let marker = if (word..word + 32).contains(&offset) { '>' } else { ' ' };
                let _ = write!(dump, "{marker}{word:#010x}:");
            }
            let value = page
                .atomic_u32((word - page_start) as usize)
                .load(Ordering::Acquire);
            let _ = write!(dump, " {value:08x}");
            word += 4;
        }
        Ok(dump)
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Marks the file as closed cleanly and releases it.
    pub(crate) fn close(self) -> LogResult<PathBuf> {
        let Region { storage, header, .. } = self;
        header.set_status(STATUS_CLOSED);
        drop(header);
        let path = storage.path().to_path_buf();
        storage.close()?;
        Ok(path)
    }

    /// Closes and deletes the file.
    pub(crate) fn close_and_remove(self) -> LogResult<PathBuf> {
        let Region { storage, header, .. } = self;
        drop(header);
        let path = storage.path().to_path_buf();
        storage.close_and_remove()?;
        Ok(path)
    }
}
