// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Paged memory-mapped file
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `MappedFile` owns the log file and maps it into memory one fixed-size page
// at a time. Pages are mapped lazily on first access, the file is grown
// (zero-filled) to cover a page before it is mapped, and mappings are never
// moved or shrunk while the file is open. Every page is handed out as an
// `Arc<Page>`, so a page stays mapped for as long as anybody holds it, even
// after the owning `MappedFile` is closed.
//
// Growth is serialised by the write half of the page table lock; looking up
// an already mapped page only takes the read half.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{LogError, LogResult};

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// One mapped page of a [`MappedFile`].
///
/// All accessors take offsets relative to the start of the page. Accessors
/// that hand out plain byte slices are `unsafe`: the page is shared between
/// threads, and callers must own the byte range they touch (see each method).
pub struct Page {
    index: u64,
    map: MmapRaw,
}

impl Page {
    /// Index of this page within the file.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Page length in bytes.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Always false: pages are never empty.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    fn check_range(&self, offset: usize, len: usize) {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.map.len());
        assert!(
            in_bounds,
            "range [{offset}, {offset}+{len}) is outside of page {} ({} bytes)",
            self.index,
            self.map.len()
        );
    }

    /// Views the 4 bytes at `offset` as an atomic integer.
    ///
    /// Panics if `offset` is not 4-byte aligned or out of bounds.
    pub(crate) fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check_range(offset, 4);
        assert_eq!(offset % 4, 0, "unaligned 32-bit header at {offset}");
        // SAFETY:
        // 1. The range was bounds-checked above and stays mapped while `self`
        //    is alive; the returned reference borrows `self`.
        // 2. The mapping base is OS-page aligned plus the page's file offset,
        //    which is a multiple of the (power of two, >= 1 KiB) page size, so
        //    a 4-aligned in-page offset yields a 4-aligned pointer.
        // 3. Every concurrent access to header words goes through atomics.
        unsafe { AtomicU32::from_ptr(self.map.as_mut_ptr().add(offset).cast()) }
    }

    /// Views the 8 bytes at `offset` as an atomic integer.
    ///
    /// Panics if `offset` is not 8-byte aligned or out of bounds.
    pub(crate) fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        self.check_range(offset, 8);
        assert_eq!(offset % 8, 0, "unaligned 64-bit header at {offset}");
        // SAFETY: as for `atomic_u32`, with 8-byte alignment.
        unsafe { AtomicU64::from_ptr(self.map.as_mut_ptr().add(offset).cast()) }
    }

    /// Borrows `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// No thread may write to the range while the slice is alive. For log
    /// entries this holds once their header (or chunk cursor) has been
    /// published, because published bytes are immutable.
    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check_range(offset, len);
        slice::from_raw_parts(self.map.as_ptr().add(offset), len)
    }

    /// Mutably borrows `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive ownership of the range, which for log
    /// entries is obtained by reserving it through a compare-and-swap on the
    /// relevant cursor. No other slice over the range may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        self.check_range(offset, len);
        slice::from_raw_parts_mut(self.map.as_mut_ptr().add(offset), len)
    }

    /// Zeroes `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Page::bytes_mut`].
    pub(crate) unsafe fn zero(&self, offset: usize, len: usize) {
        self.check_range(offset, len);
        ptr::write_bytes(self.map.as_mut_ptr().add(offset), 0, len);
    }

    /// Synchronously flushes `len` bytes at `offset` to the file.
    pub(crate) fn flush_range(&self, offset: usize, len: usize) -> LogResult<()> {
        self.check_range(offset, len);
        self.map.flush_range(offset, len)?;
        Ok(())
    }

    fn flush(&self) -> LogResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("len", &self.map.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MappedFile
// ---------------------------------------------------------------------------

struct PageTable {
    /// Slot `i` holds page `i` once it has been mapped.
    pages: Vec<Option<Arc<Page>>>,
    /// File length as last observed or set by this instance.
    file_len: u64,
}

/// A file mapped into memory in fixed-size pages.
pub struct MappedFile {
    path: PathBuf,
    file: File,
    page_size: u32,
    page_shift: u32,
    table: RwLock<PageTable>,
}

impl MappedFile {
    /// Open (or create) the file at `path`, creating missing parent
    /// directories. Nothing is mapped until a page is requested.
    pub fn open(path: impl AsRef<Path>, page_size: u32) -> LogResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !page_size.is_power_of_two() {
            return Err(LogError::InvalidPageSize {
                page_size,
                reason: "must be a power of two",
            });
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                info!(dir = %parent.display(), "Created log directory");
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        debug!(
            path = %path.display(),
            file_len,
            page_size,
            "Opened mapped file"
        );

        Ok(Self {
            path,
            file,
            page_size,
            page_shift: page_size.trailing_zeros(),
            table: RwLock::new(PageTable {
                pages: Vec::new(),
                file_len,
            }),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Returns the number of pages mapped so far.
    pub fn mapped_pages(&self) -> usize {
        self.table.read().pages.iter().flatten().count()
    }

    /// Returns the length of the backing file as reported by the filesystem.
    pub fn actual_file_size(&self) -> LogResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns the position of `offset` within its page.
    pub fn offset_in_page(&self, offset: u64) -> usize {
        (offset & u64::from(self.page_size - 1)) as usize
    }

    /// Returns the page containing `offset`, mapping it if necessary.
    pub fn page_by_offset(&self, offset: u64) -> LogResult<Arc<Page>> {
        self.page(offset >> self.page_shift)
    }

    /// Returns page `index`, growing the file and mapping the page if
    /// necessary.
    pub fn page(&self, index: u64) -> LogResult<Arc<Page>> {
        let slot = usize::try_from(index).map_err(|_| LogError::InvalidOffset {
            offset: index << self.page_shift,
            reason: "page index does not fit the address space",
        })?;

        if let Some(page) = self.table.read().pages.get(slot).and_then(Option::as_ref) {
            return Ok(Arc::clone(page));
        }

        let mut table = self.table.write();
        if let Some(page) = table.pages.get(slot).and_then(Option::as_ref) {
            return Ok(Arc::clone(page));
        }

        let page_start = index
            .checked_mul(u64::from(self.page_size))
            .ok_or(LogError::InvalidOffset {
                offset: u64::MAX,
                reason: "page offset overflows",
            })?;
        let page_end = page_start + u64::from(self.page_size);
        if table.file_len < page_end {
            self.file.set_len(page_end)?;
            debug!(
                path = %self.path.display(),
                old_len = table.file_len,
                new_len = page_end,
                "Grew mapped file"
            );
            table.file_len = page_end;
        }

        let map = MmapOptions::new()
            .offset(page_start)
            .len(self.page_size as usize)
            .map_raw(&self.file)?;
        let page = Arc::new(Page { index, map });

        if table.pages.len() <= slot {
            table.pages.resize(slot + 1, None);
        }
        table.pages[slot] = Some(Arc::clone(&page));
        debug!(path = %self.path.display(), page = index, "Mapped page");

        Ok(page)
    }

    /// Guarantees that `[offset, offset + length)` is backed by mapped pages.
    pub fn ensure_committed(&self, offset: u64, length: u64) -> LogResult<()> {
        if length == 0 {
            return Ok(());
        }
        let last = offset
            .checked_add(length - 1)
            .ok_or(LogError::InvalidOffset {
                offset,
                reason: "range end overflows",
            })?;
        for index in (offset >> self.page_shift)..=(last >> self.page_shift) {
            self.page(index)?;
        }
        Ok(())
    }

    /// Zeroes everything from `offset` up to the end of the file.
    ///
    /// Only used while opening, before the file is shared with other threads.
    pub fn zeroize_till_eof(&self, offset: u64) -> LogResult<()> {
        let file_len = self.actual_file_size()?;
        let mut cursor = offset;
        while cursor < file_len {
            let page = self.page_by_offset(cursor)?;
            let in_page = self.offset_in_page(cursor);
            let len = (self.page_size as usize - in_page).min((file_len - cursor) as usize);
            // SAFETY: called during open, while this thread is the only user
            // of the mapping.
            unsafe { page.zero(in_page, len) };
            cursor += len as u64;
        }
        debug!(path = %self.path.display(), from = offset, to = file_len, "Zeroed file tail");
        Ok(())
    }

    /// Synchronously flushes `[offset, offset + length)` to the file.
    pub fn flush_range(&self, offset: u64, length: u64) -> LogResult<()> {
        let end = offset.saturating_add(length);
        let mut cursor = offset;
        while cursor < end {
            let page = self.page_by_offset(cursor)?;
            let in_page = self.offset_in_page(cursor);
            let len = (self.page_size as usize - in_page).min((end - cursor) as usize);
            page.flush_range(in_page, len)?;
            cursor += len as u64;
        }
        Ok(())
    }

    /// Flushes every mapped page and syncs the file (including its length).
    pub fn flush(&self) -> LogResult<()> {
        let pages: Vec<Arc<Page>> = self.table.read().pages.iter().flatten().cloned().collect();
        for page in &pages {
            page.flush()?;
        }
        self.file.sync_all()?;
        debug!(path = %self.path.display(), pages = pages.len(), "Flushed mapped file");
        Ok(())
    }

    /// Flushes, unmaps and releases the file handle.
    pub fn close(self) -> LogResult<()> {
        self.flush()?;
        debug!(path = %self.path.display(), "Closed mapped file");
        Ok(())
    }

    /// Closes the file and deletes it.
    pub fn close_and_remove(self) -> LogResult<()> {
        let path = self.path.clone();
        self.close()?;
        fs::remove_file(&path)?;
        info!(path = %path.display(), "Removed log file");
        Ok(())
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("mapped_pages", &self.mapped_pages())
            .finish()
    }
}
