// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Append-only record log
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `AppendOnlyLog` stores immutable records, each addressed by an id derived
// from its file offset. Any number of threads may append and read through a
// shared reference; appenders never block each other.
//
// Append protocol:
//
// 1. Reserve header + payload with a compare-and-swap on the allocation
//    cursor (page tails that are too short become padding).
// 2. Publish the header without the committed flag.
// 3. Let the caller fill the payload.
// 4. Republish the header with the committed flag (release ordering).
// 5. Advance the commit cursor over every finished record that follows it.
//
// A reader that loads a committed header (acquire ordering) therefore sees
// the complete payload.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use tracing::{debug, info};

use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::layout::{round_up, EntryLayout, Slot};
use crate::mapped::Page;
use crate::record::{data_header, RecordLayout, RECORD_ALIGNMENT, RECORD_HEADER_SIZE};
use crate::recovery::RecoveryInfo;
use crate::region::{Located, Region};

/// Memory-mapped log of immutable, variable-length records.
pub struct AppendOnlyLog {
    region: Region<RecordLayout>,
}

impl AppendOnlyLog {
    /// Opens the record log at `path`, creating it (and missing parent
    /// directories) if necessary.
    ///
    /// An existing file is validated against `config`, entries left in
    /// flight by a crashed writer are recovered and the record count is
    /// recomputed.
    pub fn open(path: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let region = Region::open(path, config)?;
        info!(
            path = %region.path().display(),
            records = region.entry_count(),
            page_size = region.page_size(),
            "Opened append-only log"
        );
        Ok(Self { region })
    }

    // -----------------------------------------------------------------------
    // Appending
    // -----------------------------------------------------------------------

    /// Appends a copy of `payload` and returns its record id.
    pub fn append(&self, payload: &[u8]) -> LogResult<i64> {
        self.append_with(payload.len(), |buffer| buffer.copy_from_slice(payload))
    }

    /// Appends a record of `size` bytes filled in place by `writer`.
    ///
    /// Fails with [`LogError::PayloadTooLarge`] if the record does not fit a
    /// page; nothing is reserved in that case. If `writer` panics the record
    /// becomes padding and the panic propagates.
    pub fn append_with(&self, size: usize, writer: impl FnOnce(&mut [u8])) -> LogResult<i64> {
        self.region.check_payload_size(size as u64)?;
        let payload_len = size as u32;
        let length = round_up(u64::from(payload_len + RECORD_HEADER_SIZE), RECORD_ALIGNMENT) as u32;

        let (offset, page) = self.region.allocate(length)?;
        let in_page = self.region.storage().offset_in_page(offset);
        RecordLayout::store_header(&page, in_page, data_header(payload_len, false));

        let mut abandon = AbandonOnUnwind {
            region: &self.region,
            page: &page,
            in_page,
            length,
            armed: true,
        };
        // SAFETY: the reservation gave this call exclusive ownership of the
        // record; readers reject it until the committed header is published.
        writer(unsafe { page.bytes_mut(in_page + RECORD_HEADER_SIZE as usize, size) });
        abandon.armed = false;

        RecordLayout::store_header(&page, in_page, data_header(payload_len, true));
        self.region.try_commit()?;
        self.region.after_write(offset, u64::from(length))?;

        let id = self.region.id_of(offset)?;
        debug!(id, offset, size, "Appended record");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Hands the payload of record `id` to `reader` and returns its result.
    ///
    /// The slice is only valid for the duration of the call.
    pub fn read<T>(&self, id: i64, reader: impl FnOnce(&[u8]) -> T) -> LogResult<T> {
        let located = self.region.locate(id)?;
        match located.slot {
            Slot::Data {
                payload_len,
                finished: true,
                ..
            } => Ok(reader(payload(&located, payload_len))),
            _ => Err(LogError::NotCommitted {
                id,
                offset: located.offset,
                header: RecordLayout::raw_header(&located.page, located.offset_in_page) as u32,
            }),
        }
    }

    /// Copies the payload of record `id`.
    pub fn read_to_vec(&self, id: i64) -> LogResult<Vec<u8>> {
        self.read(id, <[u8]>::to_vec)
    }

    /// Visits every committed record in id order.
    ///
    /// Returns `Ok(false)` if `visitor` stopped the walk by returning false.
    pub fn for_each_record(&self, mut visitor: impl FnMut(i64, &[u8]) -> bool) -> LogResult<bool> {
        self.region.scan(self.region.committed(), |located| match located.slot {
            Slot::Data { payload_len, .. } => {
                let id = self.region.id_of(located.offset)?;
                Ok(visitor(id, payload(located, payload_len)))
            }
            _ => Ok(true),
        })
    }

    /// True if `id` points at a committed record.
    pub fn is_valid_id(&self, id: i64) -> bool {
        matches!(
            self.region.locate(id),
            Ok(Located {
                slot: Slot::Data { finished: true, .. },
                ..
            })
        )
    }

    /// Hex dump of the file around record `id`, for diagnostics.
    pub fn dump_around(&self, id: i64, width: u64) -> LogResult<String> {
        let offset = crate::record::record_id_to_offset(id)?;
        if offset >= self.region.allocated() {
            return Err(LogError::IdOutOfRange {
                id,
                offset,
                allocated_up_to: self.region.allocated(),
                diagnostics: self.region.recovery().diagnostics(),
            });
        }
        self.region.dump_around(offset, width)
    }

    // -----------------------------------------------------------------------
    // Header and state
    // -----------------------------------------------------------------------

    /// Number of committed records.
    pub fn records_count(&self) -> u64 {
        self.region.entry_count()
    }

    /// True if nothing was ever appended.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Largest payload a single record can hold.
    pub fn max_payload_size(&self) -> u32 {
        self.region.max_payload_size()
    }

    pub fn page_size(&self) -> u32 {
        self.region.page_size()
    }

    pub fn config(&self) -> &LogConfig {
        self.region.config()
    }

    /// Caller-defined version of the data stored in the log.
    pub fn data_version(&self) -> u32 {
        self.region.header().data_version()
    }

    pub fn set_data_version(&self, version: u32) {
        self.region.header().set_data_version(version);
    }

    /// Reads caller-defined header field `field` (`0..USER_HEADER_FIELDS`).
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

    /// What happened while the file was opened.
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

    /// Flushes all records and the header to disk.
    pub fn sync(&self) -> LogResult<()> {
        self.region.sync()
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Flushes, marks the file as closed cleanly and releases it.
    pub fn close(self) -> LogResult<PathBuf> {
        let records = self.records_count();
        let path = self.region.close()?;
        info!(path = %path.display(), records, "Closed append-only log");
        Ok(path)
    }

    /// Closes the log and deletes its file.
    pub fn close_and_remove(self) -> LogResult<PathBuf> {
        let path = self.region.close_and_remove()?;
        info!(path = %path.display(), "Closed and removed append-only log");
        Ok(path)
    }
}

impl std::fmt::Debug for AppendOnlyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendOnlyLog")
            .field("path", &self.region.path())
            .field("page_size", &self.region.page_size())
            .field("records", &self.region.entry_count())
            .finish()
    }
}

fn payload(located: &Located, payload_len: u32) -> &[u8] {
    // SAFETY: the header was loaded committed, so the payload is complete
    // and is never written again.
    unsafe {
        located.page.bytes(
            located.offset_in_page + RECORD_HEADER_SIZE as usize,
            payload_len as usize,
        )
    }
}

/// Turns a record into padding if its writer unwinds, so the commit cursor
/// can move past it.
struct AbandonOnUnwind<'a> {
    region: &'a Region<RecordLayout>,
    page: &'a Page,
    in_page: usize,
    length: u32,
    armed: bool,
}

impl Drop for AbandonOnUnwind<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        RecordLayout::put_padding(self.page, self.in_page, self.length);
        let _ = self.region.try_commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FormatCheck;
    use crate::layout::USER_HEADER_FIELDS;
    use crate::record::{record_id_to_offset, record_offset_to_id};
    use tempfile::TempDir;

    const PAGE: u32 = 4096;

    fn open(dir: &TempDir) -> AppendOnlyLog {
        AppendOnlyLog::open(dir.path().join("records.log"), LogConfig::default().with_page_size(PAGE))
            .unwrap()
    }

    #[test]
    fn test_fresh_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        assert!(log.is_empty());
        assert_eq!(log.records_count(), 0);
        assert_eq!(log.max_payload_size(), PAGE - 4);
        assert!(log.for_each_record(|_, _| panic!("no records")).unwrap());
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let first = log.append(b"test data").unwrap();
        let second = log.append(b"").unwrap();
        assert_eq!(first, 1);
        assert_eq!(record_id_to_offset(second).unwrap(), 64 + 16);
        assert_eq!(log.read_to_vec(first).unwrap(), b"test data");
        assert_eq!(log.read(second, |bytes| bytes.len()).unwrap(), 0);
        assert_eq!(log.records_count(), 2);
        assert!(!log.is_empty());
    }

    #[test]
    fn test_ids_grow_with_appends() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let ids: Vec<i64> = (0..100u32)
            .map(|i| log.append(&i.to_le_bytes()).unwrap())
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_oversized_payload_is_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append(b"x").unwrap();

        let result = log.append(&vec![0u8; PAGE as usize - 3]);
        assert!(matches!(result, Err(LogError::PayloadTooLarge { .. })));
        assert_eq!(log.records_count(), 1);
        assert_eq!(log.append(b"y").unwrap(), record_offset_to_id(72).unwrap());
    }

    #[test]
    fn test_record_that_does_not_fit_starts_next_page() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append(&vec![1u8; 3000]).unwrap();
        let id = log.append(&vec![2u8; 2000]).unwrap();
        assert_eq!(record_id_to_offset(id).unwrap(), u64::from(PAGE));

        // The tail of page 0 is padding.
        let padding_id = record_offset_to_id(64 + 3004).unwrap();
        assert!(matches!(log.read_to_vec(padding_id), Err(LogError::PaddingEntry { .. })));
        assert_eq!(log.records_count(), 2);
    }

    #[test]
    fn test_full_page_record() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let payload = vec![7u8; log.max_payload_size() as usize];
        let id = log.append(&payload).unwrap();
        assert_eq!(record_id_to_offset(id).unwrap(), u64::from(PAGE));
        assert_eq!(log.read_to_vec(id).unwrap(), payload);
    }

    #[test]
    fn test_bad_ids() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let id = log.append(b"abcdef").unwrap();

        assert!(matches!(log.read_to_vec(0), Err(LogError::InvalidId { .. })));
        assert!(matches!(log.read_to_vec(-5), Err(LogError::InvalidId { .. })));
        assert!(matches!(log.read_to_vec(id + 3), Err(LogError::IdOutOfRange { .. })));
        assert!(log.is_valid_id(id));
        assert!(!log.is_valid_id(id + 3));
    }

    #[test]
    fn test_boundary_verification_rejects_mid_record_ids() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig::default()
            .with_page_size(PAGE)
            .with_entry_boundary_verification(true);
        let log = AppendOnlyLog::open(dir.path().join("records.log"), config).unwrap();
        let id = log.append(&[0xAB; 32]).unwrap();
        log.append(b"tail").unwrap();

        assert!(matches!(log.read_to_vec(id + 2), Err(LogError::NotAnEntry { .. })));
        assert_eq!(log.read_to_vec(id).unwrap(), vec![0xAB; 32]);
    }

    #[test]
    fn test_panicking_writer_leaves_padding() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            log.append_with(16, |_| panic!("writer failed")).unwrap();
        }));
        assert!(result.is_err());

        let id = log.append(b"after").unwrap();
        assert_eq!(log.read_to_vec(id).unwrap(), b"after");
        assert_eq!(log.records_count(), 1);
        assert!(matches!(log.read_to_vec(1), Err(LogError::PaddingEntry { .. })));
    }

    #[test]
    fn test_for_each_stops_early() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        for i in 0..10u8 {
            log.append(&[i]).unwrap();
        }
        let mut seen = Vec::new();
        let completed = log
            .for_each_record(|_, bytes| {
                seen.push(bytes[0]);
                seen.len() < 3
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_header_fields_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.set_data_version(42);
        log.set_user_header_field(0, 7).unwrap();
        log.set_user_header_field(USER_HEADER_FIELDS - 1, 9).unwrap();
        assert!(matches!(
            log.set_user_header_field(USER_HEADER_FIELDS, 1),
            Err(LogError::HeaderFieldOutOfRange { .. })
        ));
        log.close().unwrap();

        let log = open(&dir);
        assert_eq!(log.data_version(), 42);
        assert_eq!(log.user_header_field(0).unwrap(), 7);
        assert_eq!(log.user_header_field(USER_HEADER_FIELDS - 1).unwrap(), 9);
        assert_eq!(log.user_header_field(1).unwrap(), 0);
    }

    #[test]
    fn test_page_size_mismatch() {
        let dir = TempDir::new().unwrap();
        open(&dir).close().unwrap();

        let path = dir.path().join("records.log");
        let strict = AppendOnlyLog::open(&path, LogConfig::default().with_page_size(2 * PAGE));
        assert!(matches!(
            strict,
            Err(LogError::PageSizeMismatch { file_page_size: PAGE, page_size, .. }) if page_size == 2 * PAGE
        ));
    }

    fn ignoring(page_size: u32) -> LogConfig {
        LogConfig::default()
            .with_page_size(page_size)
            .with_format_check(FormatCheck::Ignore)
    }

    #[test]
    fn test_ignored_page_size_keeps_file_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.log");
        let payload = |i: u8| vec![i; 3000];

        // Written with large pages, reopened asking for small ones.
        let log = AppendOnlyLog::open(&path, LogConfig::default().with_page_size(2 * PAGE)).unwrap();
        let mut ids: Vec<i64> = (0..3).map(|i| log.append(&payload(i)).unwrap()).collect();
        log.close().unwrap();

        let log = AppendOnlyLog::open(&path, ignoring(PAGE)).unwrap();
        assert_eq!(log.page_size(), 2 * PAGE);
        assert_eq!(log.config().page_size, 2 * PAGE);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(log.read_to_vec(*id).unwrap(), payload(i as u8));
        }
        ids.push(log.append(&payload(3)).unwrap());
        log.close().unwrap();

        let log = AppendOnlyLog::open(&path, LogConfig::default().with_page_size(2 * PAGE)).unwrap();
        assert_eq!(log.records_count(), 4);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(log.read_to_vec(*id).unwrap(), payload(i as u8));
        }
    }

    #[test]
    fn test_ignored_page_size_appends_use_file_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.log");
        open(&dir).close().unwrap();

        let log = AppendOnlyLog::open(&path, ignoring(2 * PAGE)).unwrap();
        assert_eq!(log.max_payload_size(), PAGE - 4);
        let ids: Vec<i64> = (0..3u8).map(|i| log.append(&[i; 3000]).unwrap()).collect();
        log.close().unwrap();

        let log = open(&dir);
        assert_eq!(log.records_count(), 3);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(log.read_to_vec(*id).unwrap(), vec![i as u8; 3000]);
        }
    }

    #[test]
    fn test_implementation_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.log");
        let log = open(&dir);
        let id = log.append(b"old format").unwrap();
        log.close().unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[4..8].copy_from_slice(&99u32.to_ne_bytes());
        std::fs::write(&path, &raw).unwrap();

        let strict = AppendOnlyLog::open(&path, LogConfig::default().with_page_size(PAGE));
        assert!(matches!(
            strict,
            Err(LogError::UnsupportedVersion { found: 99, supported: 2, .. })
        ));

        let log = AppendOnlyLog::open(&path, ignoring(PAGE)).unwrap();
        assert_eq!(log.read_to_vec(id).unwrap(), b"old format");
        assert_eq!(log.records_count(), 1);
    }

    #[test]
    fn test_dump_around_marks_record() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let id = log.append(b"ABCD").unwrap();
        let dump = log.dump_around(id, 16).unwrap();
        assert!(dump.contains(">0x00000030:"));
        assert!(dump.contains(&format!("{:08x}", u32::from_ne_bytes(*b"ABCD"))));
        assert!(log.dump_around(id + 100, 16).is_err());
    }

    #[test]
    fn test_dump_around_with_huge_width_stays_in_page() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let id = log.append(b"wide").unwrap();
        let dump = log.dump_around(id, u64::MAX).unwrap();
        assert!(dump.starts_with(" 0x00000000:"));
        assert!(dump.contains(">0x00000040:"));
        // One line per 32 bytes of the first page.
        assert_eq!(dump.lines().count(), PAGE as usize / 32);
    }

    #[test]
    fn test_close_and_remove() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        log.append(b"gone").unwrap();
        let path = log.close_and_remove().unwrap();
        assert!(!path.exists());
    }
}
