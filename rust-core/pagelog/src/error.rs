// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Defines all error conditions that can arise while opening, appending to,
// reading from, or recovering a memory-mapped log file.

use thiserror::Error;

/// Errors that can occur during log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// An I/O error occurred while growing, mapping, flushing or removing
    /// the log file.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload (or requested chunk capacity) can never fit into a single
    /// page together with its header.
    #[error("payload of {size} bytes is too large: at most {max} bytes fit a {page_size}-byte page")]
    PayloadTooLarge {
        /// The requested payload size.
        size: u64,
        /// The largest payload a page can hold.
        max: u32,
        /// The configured page size.
        page_size: u32,
    },

    /// A chunk was requested with a capacity of zero.
    #[error("chunk capacity must be positive, got {0}")]
    InvalidCapacity(u32),

    /// The configured page size is unusable.
    #[error("invalid page size {page_size}: {reason}")]
    InvalidPageSize {
        /// The rejected page size.
        page_size: u32,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An id can not correspond to any entry offset.
    #[error("invalid id {id}: {reason}")]
    InvalidId {
        /// The rejected id.
        id: i64,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A file offset can not correspond to any entry id.
    #[error("invalid offset {offset}: {reason}")]
    InvalidOffset {
        /// The rejected offset.
        offset: u64,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The id decodes to an offset that was never allocated.
    #[error("id {id} (offset {offset}) is outside of the allocated region [..{allocated_up_to}){diagnostics}")]
    IdOutOfRange {
        /// The requested id.
        id: i64,
        /// The offset the id decodes to.
        offset: u64,
        /// The current allocation cursor.
        allocated_up_to: u64,
        /// Recovery context, empty when nothing noteworthy happened on open.
        diagnostics: String,
    },

    /// The id points at a padding entry, which is never returned to callers.
    #[error("id {id} (offset {offset}) points at padding, not at a data entry")]
    PaddingEntry {
        /// The requested id.
        id: i64,
        /// The offset the id decodes to.
        offset: u64,
    },

    /// The id points at an entry whose writer has not finished yet.
    #[error("entry {id} (offset {offset}) is not committed yet: header {header:#010x}")]
    NotCommitted {
        /// The requested id.
        id: i64,
        /// The offset the id decodes to.
        offset: u64,
        /// The raw entry header found at the offset (low 32 bits for chunks).
        header: u32,
    },

    /// The id decodes to an allocated offset that is not the start of an
    /// entry (only detected when entry boundary verification is enabled).
    #[error("id {id} (offset {offset}) does not point at the start of an entry")]
    NotAnEntry {
        /// The requested id.
        id: i64,
        /// The offset the id decodes to.
        offset: u64,
    },

    /// The log content does not decode.
    #[error("log {path} is corrupted at offset {offset}: {detail}{diagnostics}")]
    Corrupted {
        /// The log file path.
        path: String,
        /// The offset of the undecodable bytes.
        offset: u64,
        /// What exactly failed to decode.
        detail: String,
        /// Recovery context, empty when nothing noteworthy happened on open.
        diagnostics: String,
    },

    /// The file header does not carry the expected magic word.
    #[error("{path} is not a {expected} file: magic word {found:#010x}")]
    MagicMismatch {
        /// The log file path.
        path: String,
        /// The kind of log that was expected.
        expected: &'static str,
        /// The magic word found in the file header.
        found: u32,
    },

    /// The file was written by an incompatible implementation version.
    #[error("{path} has implementation version {found}, but version {supported} is required")]
    UnsupportedVersion {
        /// The log file path.
        path: String,
        /// The version found in the file header.
        found: u32,
        /// The version this build reads and writes.
        supported: u32,
    },

    /// The file was created with a different page size.
    #[error("{path} was created with page size {file_page_size}, but page size {page_size} was requested")]
    PageSizeMismatch {
        /// The log file path.
        path: String,
        /// The page size recorded in the file header.
        file_page_size: u32,
        /// The page size requested by the configuration.
        page_size: u32,
    },

    /// The file header does not identify any known log kind.
    #[error("{path} is not a recognised log file: magic word {found:#010x}")]
    UnknownLogKind {
        /// The log file path.
        path: String,
        /// The magic word found in the file header.
        found: u32,
    },

    /// A caller-defined header field index is out of range.
    #[error("header field {field} is out of range: only {available} fields exist")]
    HeaderFieldOutOfRange {
        /// The requested field index.
        field: usize,
        /// The number of caller-defined header fields.
        available: usize,
    },
}

/// Convenience type alias for log results.
pub type LogResult<T> = Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_payload_too_large() {
        let error = LogError::PayloadTooLarge {
            size: 262_141,
            max: 262_140,
            page_size: 262_144,
        };
        let message = format!("{error}");
        assert!(message.contains("262141"));
        assert!(message.contains("262140"));
    }

    #[test]
    fn test_error_display_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let error = LogError::Io(io_error);
        let message = format!("{error}");
        assert!(message.contains("disk full"));
    }

    #[test]
    fn test_error_display_not_committed() {
        let error = LogError::NotCommitted {
            id: 3,
            offset: 72,
            header: 0x0000_000D,
        };
        let message = format!("{error}");
        assert!(message.contains("0x0000000d"));
        assert!(message.contains("72"));
    }

    #[test]
    fn test_error_display_magic_mismatch() {
        let error = LogError::MagicMismatch {
            path: "/tmp/records.log".to_string(),
            expected: "record log",
            found: 0xDEAD_BEEF,
        };
        let message = format!("{error}");
        assert!(message.contains("0xdeadbeef"));
        assert!(message.contains("record log"));
    }

    #[test]
    fn test_error_display_out_of_range_carries_diagnostics() {
        let error = LogError::IdOutOfRange {
            id: 100,
            offset: 460,
            allocated_up_to: 128,
            diagnostics: " (recovered region [96..128) on open)".to_string(),
        };
        let message = format!("{error}");
        assert!(message.contains("[..128)"));
        assert!(message.contains("recovered region"));
    }
}
