// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Configuration
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Options shared by both log kinds: page size, how strictly an existing
// file's header is checked on open, and how eagerly writes are flushed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LogError, LogResult};

/// Default page size (256 KiB).
pub const DEFAULT_PAGE_SIZE: u32 = 256 * 1024;

/// Smallest page size accepted by either log kind (1 KiB).
pub const MIN_PAGE_SIZE: u32 = 1024;

// ---------------------------------------------------------------------------
// FormatCheck
// ---------------------------------------------------------------------------

/// How the header of an existing log file is validated on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatCheck {
    /// Reject files written by another implementation version or with another
    /// page size.
    #[default]
    Strict,

    /// Only check the magic word. Version and page size differences are
    /// logged and otherwise ignored; intended for tests and migrations. An
    /// existing file is always mapped with the page size in its header.
    Ignore,
}

// ---------------------------------------------------------------------------
// SyncMode
// ---------------------------------------------------------------------------

/// Controls how aggressively dirty mapped pages are flushed to stable storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Flush the written byte range after every append. Acknowledged writes
    /// survive a crash, at the cost of one `msync` per append.
    Fsync,

    /// Flush the whole file at most once per the specified duration.
    Periodic(Duration),

    /// Never flush explicitly; the OS writes dirty pages back eventually, and
    /// `sync()`/`close()` flush on demand.
    #[default]
    Async,
}

// ---------------------------------------------------------------------------
// LogConfig
// ---------------------------------------------------------------------------

/// Configuration for opening an [`AppendOnlyLog`](crate::AppendOnlyLog) or a
/// [`ChunkedLog`](crate::ChunkedLog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Size of one mapped page. Power of two; fixed once the file is created.
    pub page_size: u32,
    /// Header validation applied to existing files.
    pub format_check: FormatCheck,
    /// Flushing policy.
    pub sync_mode: SyncMode,
    /// Walk the containing page on every read to make sure the id points at
    /// the start of an entry, not into the middle of one.
    pub verify_entry_boundaries: bool,
}

impl LogConfig {
    /// Returns a copy with the given page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Returns a copy with the given format check.
    pub fn with_format_check(mut self, format_check: FormatCheck) -> Self {
        self.format_check = format_check;
        self
    }

    /// Returns a copy with the given sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Returns a copy with entry boundary verification switched on or off.
    pub fn with_entry_boundary_verification(mut self, enabled: bool) -> Self {
        self.verify_entry_boundaries = enabled;
        self
    }

    /// Checks the page size against the limits of a log kind.
    pub fn validate(&self, max_page_size: u32) -> LogResult<()> {
        let page_size = self.page_size;
        if !page_size.is_power_of_two() {
            return Err(LogError::InvalidPageSize {
                page_size,
                reason: "must be a power of two",
            });
        }
        if page_size < MIN_PAGE_SIZE {
            return Err(LogError::InvalidPageSize {
                page_size,
                reason: "must be at least 1 KiB",
            });
        }
        if page_size > max_page_size {
            return Err(LogError::InvalidPageSize {
                page_size,
                reason: "exceeds the maximum page size of this log kind",
            });
        }
        Ok(())
    }
}

impl Default for LogConfig {
    /// Defaults:
    /// - page_size: 256 KiB
    /// - format_check: strict
    /// - sync_mode: async
    /// - verify_entry_boundaries: false
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            format_check: FormatCheck::Strict,
            sync_mode: SyncMode::Async,
            verify_entry_boundaries: false,
        }
    }
}
