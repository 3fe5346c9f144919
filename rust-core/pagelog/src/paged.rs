// SPDX-License-Identifier: PMPL-1.0-or-later
//
// pagelog - Log kind detection and the PagedLog factory
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Tools that handle log files without knowing in advance what they contain
// (the inspector, migration scripts) open them through `PagedLog`, which
// picks the right log type from the magic word in the file header.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkLayout;
use crate::chunked::ChunkedLog;
use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::layout::{EntryLayout, HeaderSnapshot};
use crate::log::AppendOnlyLog;
use crate::record::RecordLayout;
use crate::recovery::RecoveryInfo;

/// The two kinds of log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Immutable records ([`AppendOnlyLog`]).
    Records,
    /// Chunks with reserved capacity ([`ChunkedLog`]).
    Chunks,
}

impl LogKind {
    /// Magic word stored at the start of files of this kind.
    pub fn magic_word(self) -> u32 {
        match self {
            LogKind::Records => RecordLayout::MAGIC_WORD,
            LogKind::Chunks => ChunkLayout::MAGIC_WORD,
        }
    }

    pub fn from_magic_word(magic: u32) -> Option<Self> {
        [LogKind::Records, LogKind::Chunks]
            .into_iter()
            .find(|kind| kind.magic_word() == magic)
    }

    /// Largest page size files of this kind accept.
    pub fn max_page_size(self) -> u32 {
        match self {
            LogKind::Records => RecordLayout::MAX_PAGE_SIZE,
            LogKind::Chunks => ChunkLayout::MAX_PAGE_SIZE,
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogKind::Records => f.write_str(RecordLayout::KIND),
            LogKind::Chunks => f.write_str(ChunkLayout::KIND),
        }
    }
}

/// Reads the header of `path` and reports which kind of log it holds.
///
/// Returns `Ok(None)` if the file is missing, shorter than a header, or has
/// never been initialised; fails with [`LogError::UnknownLogKind`] if the
/// magic word belongs to neither kind.
pub fn detect_kind(path: impl AsRef<Path>) -> LogResult<Option<LogKind>> {
    let path = path.as_ref();
    let Some(snapshot) = HeaderSnapshot::read(path)? else {
        return Ok(None);
    };
    if snapshot.magic_word == 0 {
        return Ok(None);
    }
    LogKind::from_magic_word(snapshot.magic_word)
        .map(Some)
        .ok_or_else(|| LogError::UnknownLogKind {
            path: path.display().to_string(),
            found: snapshot.magic_word,
        })
}

/// A log of either kind.
#[derive(Debug)]
pub enum PagedLog {
    Records(AppendOnlyLog),
    Chunks(ChunkedLog),
}

/// Forwards a call to whichever log is inside.
macro_rules! either {
    ($log:expr, $inner:ident => $call:expr) => {
        match $log {
            PagedLog::Records($inner) => $call,
            PagedLog::Chunks($inner) => $call,
        }
    };
}

impl PagedLog {
    /// Opens (or creates) a log of the given kind.
    pub fn open(path: impl AsRef<Path>, kind: LogKind, config: LogConfig) -> LogResult<Self> {
        Ok(match kind {
            LogKind::Records => PagedLog::Records(AppendOnlyLog::open(path, config)?),
            LogKind::Chunks => PagedLog::Chunks(ChunkedLog::open(path, config)?),
        })
    }

    /// Opens an existing log, detecting its kind from the file header.
    pub fn open_existing(path: impl AsRef<Path>, config: LogConfig) -> LogResult<Self> {
        let path = path.as_ref();
        match detect_kind(path)? {
            Some(kind) => Self::open(path, kind, config),
            None => Err(LogError::UnknownLogKind {
                path: path.display().to_string(),
                found: 0,
            }),
        }
    }

    pub fn kind(&self) -> LogKind {
        match self {
            PagedLog::Records(_) => LogKind::Records,
            PagedLog::Chunks(_) => LogKind::Chunks,
        }
    }

    pub fn as_records(&self) -> Option<&AppendOnlyLog> {
        match self {
            PagedLog::Records(log) => Some(log),
            PagedLog::Chunks(_) => None,
        }
    }

    pub fn as_chunks(&self) -> Option<&ChunkedLog> {
        match self {
            PagedLog::Chunks(log) => Some(log),
            PagedLog::Records(_) => None,
        }
    }

    /// Number of records or chunks.
    pub fn entries_count(&self) -> u64 {
        match self {
            PagedLog::Records(log) => log.records_count(),
            PagedLog::Chunks(log) => log.chunks_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        either!(self, log => log.is_empty())
    }

    pub fn page_size(&self) -> u32 {
        either!(self, log => log.page_size())
    }

    pub fn max_payload_size(&self) -> u32 {
        either!(self, log => log.max_payload_size())
    }

    pub fn data_version(&self) -> u32 {
        either!(self, log => log.data_version())
    }

    pub fn set_data_version(&self, version: u32) {
        either!(self, log => log.set_data_version(version))
    }

    pub fn user_header_field(&self, field: usize) -> LogResult<u32> {
        either!(self, log => log.user_header_field(field))
    }

    pub fn set_user_header_field(&self, field: usize, value: u32) -> LogResult<()> {
        either!(self, log => log.set_user_header_field(field, value))
    }

    pub fn recovery_info(&self) -> &RecoveryInfo {
        either!(self, log => log.recovery_info())
    }

    pub fn is_valid_id(&self, id: i64) -> bool {
        either!(self, log => log.is_valid_id(id))
    }

    pub fn dump_around(&self, id: i64, width: u64) -> LogResult<String> {
        either!(self, log => log.dump_around(id, width))
    }

    pub fn storage_path(&self) -> &Path {
        either!(self, log => log.storage_path())
    }

    pub fn sync(&self) -> LogResult<()> {
        either!(self, log => log.sync())
    }

    pub fn close(self) -> LogResult<PathBuf> {
        either!(self, log => log.close())
    }

    pub fn close_and_remove(self) -> LogResult<PathBuf> {
        either!(self, log => log.close_and_remove())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> LogConfig {
        LogConfig::default().with_page_size(4096)
    }

    #[test]
    fn test_detect_kind() {
        let dir = TempDir::new().unwrap();
        let records = dir.path().join("records.log");
        let chunks = dir.path().join("chunks.log");
        AppendOnlyLog::open(&records, config()).unwrap().close().unwrap();
        ChunkedLog::open(&chunks, config()).unwrap().close().unwrap();

        assert_eq!(detect_kind(&records).unwrap(), Some(LogKind::Records));
        assert_eq!(detect_kind(&chunks).unwrap(), Some(LogKind::Chunks));
        assert_eq!(detect_kind(dir.path().join("missing.log")).unwrap(), None);
    }

    #[test]
    fn test_unknown_magic_word() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.bin");
        std::fs::write(&path, [0x5Au8; 64]).unwrap();
        assert!(matches!(detect_kind(&path), Err(LogError::UnknownLogKind { .. })));
        assert!(PagedLog::open_existing(&path, config()).is_err());
    }

    #[test]
    fn test_open_existing_picks_the_right_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.log");
        {
            let log = PagedLog::open(&path, LogKind::Chunks, config()).unwrap();
            let chunk = log.as_chunks().unwrap().append(10).unwrap();
            assert!(chunk.append_bytes(b"abc"));
            log.set_data_version(3);
            log.close().unwrap();
        }

        let log = PagedLog::open_existing(&path, config()).unwrap();
        assert_eq!(log.kind(), LogKind::Chunks);
        assert!(log.as_records().is_none());
        assert_eq!(log.entries_count(), 1);
        assert_eq!(log.data_version(), 3);
        assert_eq!(log.max_payload_size(), 4096 - 8);
        assert!(log.close_and_remove().is_ok());
    }

    #[test]
    fn test_kind_magic_words() {
        assert_eq!(LogKind::from_magic_word(LogKind::Records.magic_word()), Some(LogKind::Records));
        assert_eq!(LogKind::from_magic_word(0), None);
        assert_eq!(LogKind::Chunks.to_string(), "chunk log");
        assert_eq!(serde_json::to_string(&LogKind::Records).unwrap(), "\"records\"");
    }
}
