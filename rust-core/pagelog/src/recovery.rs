// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Recovery on open
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// When a process dies with appends in flight, the commit cursor stays behind
// the allocation cursor. On the next open the region between them is walked
// once:
//
// - finished entries are kept;
// - records whose writer never finished become padding;
// - the first missing or undecodable header ends the log, and everything
//   from there to the end of the file is zeroed.
//
// Both cursors are then set to the end of the kept region, and the entry
// count is recomputed by a full forward scan (which also runs after clean
// shutdowns, so a stale count in the header never survives an open).

use std::ops::Range;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::error::LogResult;
use crate::layout::{EntryLayout, Slot, FILE_HEADER_SIZE};
use crate::region::Region;

/// What happened to a log file while it was being opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInfo {
    was_closed_properly: bool,
    recovered_region: Option<Range<u64>>,
    recovered_tail: u64,
    abandoned_records: u64,
    rolled_back_chunks: u64,
}

impl RecoveryInfo {
    pub(crate) fn new(was_closed_properly: bool) -> Self {
        Self {
            was_closed_properly,
            recovered_region: None,
            recovered_tail: 0,
            abandoned_records: 0,
            rolled_back_chunks: 0,
        }
    }

    /// True if the previous session closed the file cleanly.
    pub fn was_closed_properly(&self) -> bool {
        self.was_closed_properly
    }

    /// True if in-flight entries or chunk appends had to be repaired.
    pub fn was_recovery_needed(&self) -> bool {
        self.recovered_region.is_some() || self.rolled_back_chunks > 0
    }

    /// The `[committed, allocated)` region found on open, if it was not empty.
    pub fn recovered_region(&self) -> Option<Range<u64>> {
        self.recovered_region.clone()
    }

    /// Where the log ends after recovery, if recovery ran.
    pub fn recovered_tail(&self) -> Option<u64> {
        self.recovered_region.as_ref().map(|_| self.recovered_tail)
    }

    /// Records whose writers never finished and which were turned into
    /// padding.
    pub fn abandoned_records(&self) -> u64 {
        self.abandoned_records
    }

    /// Chunks whose unpublished appends were rolled back.
    pub fn rolled_back_chunks(&self) -> u64 {
        self.rolled_back_chunks
    }

    pub(crate) fn note_rolled_back_chunks(&mut self, chunks: u64) {
        self.rolled_back_chunks += chunks;
    }

    /// Suffix for error messages; empty when the open was uneventful.
    pub(crate) fn diagnostics(&self) -> String {
        match &self.recovered_region {
            Some(region) => format!(
                " (on open, in-flight region [{}..{}) was recovered up to {}, {} abandoned records; closed properly before: {})",
                region.start,
                region.end,
                self.recovered_tail,
                self.abandoned_records,
                self.was_closed_properly
            ),
            None if !self.was_closed_properly => {
                " (log was not closed properly before the last open)".to_string()
            }
            None => String::new(),
        }
    }
}

impl<L: EntryLayout> Region<L> {
    /// Repairs `[committed, allocated)`; see the module docs.
    pub(crate) fn recover_in_flight_entries(&mut self) -> LogResult<()> {
        let committed = self.committed();
        let allocated = self.allocated();
        let aligned = |offset: u64| offset % L::ALIGNMENT == 0;
        if committed < FILE_HEADER_SIZE
            || committed > allocated
            || !aligned(committed)
            || !aligned(allocated)
        {
            return Err(self.corrupted(
                committed,
                format!("inconsistent cursors: committed {committed}, allocated {allocated}"),
            ));
        }
        // Pages are grown before the allocation cursor moves onto them.
        let file_size = self.storage().actual_file_size()?;
        if allocated > file_size {
            return Err(self.corrupted(
                allocated,
                format!("allocation cursor is past the end of the {file_size}-byte file"),
            ));
        }
        if committed == allocated {
            return Ok(());
        }

        warn!(
            path = %self.path().display(),
            committed,
            allocated,
            "Recovering entries that were in flight when the log was last used"
        );

        let mut tail = committed;
        let mut abandoned = 0u64;
        while tail < allocated {
            let page = self.storage().page_by_offset(tail)?;
            let in_page = self.storage().offset_in_page(tail);
            match self.slot_at(&page, in_page) {
                Slot::Padding { length }
                | Slot::Data {
                    length,
                    finished: true,
                    ..
                } => tail += u64::from(length),
                Slot::Data {
                    length,
                    finished: false,
                    ..
                } => {
                    L::put_padding(&page, in_page, length);
                    abandoned += 1;
                    tail += u64::from(length);
                }
                Slot::Unset | Slot::Invalid { .. } => break,
            }
        }

        self.storage().zeroize_till_eof(tail)?;
        self.header().allocated().store(tail, Ordering::Release);
        self.header().committed().store(tail, Ordering::Release);
        self.header().flush()?;

        let recovery = self.recovery_mut();
        recovery.recovered_region = Some(committed..allocated);
        recovery.recovered_tail = tail;
        recovery.abandoned_records = abandoned;

        warn!(
            path = %self.path().display(),
            tail,
            lost_bytes = allocated - tail,
            abandoned_records = abandoned,
            "Recovered log tail"
        );
        Ok(())
    }

    /// Recomputes the entry count from the committed region.
    pub(crate) fn recount_entries(&mut self) -> LogResult<()> {
        let mut count = 0u64;
        self.scan(self.committed(), |located| {
            if matches!(located.slot, Slot::Data { .. }) {
                count += 1;
            }
            Ok(true)
        })?;

        let stored = self.entry_count();
        if stored != count {
            warn!(
                path = %self.path().display(),
                stored,
                counted = count,
                "Entry count in header was stale"
            );
            self.header().entry_count().store(count, Ordering::Release);
        }
        debug!(path = %self.path().display(), entries = count, "Counted entries");
        Ok(())
    }
}
