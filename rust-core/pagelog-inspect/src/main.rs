// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! pagelog-inspect: prints what a pagelog file contains.
//!
//! Without flags only the 64-byte header is read, so inspecting a file never
//! changes it. `--entries` and `--dump` open the log, which marks it as open
//! and runs recovery if the previous session crashed; the log is closed
//! cleanly afterwards.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use pagelog::{HeaderSnapshot, LogConfig, LogError, LogKind, PagedLog};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bytes of each entry shown in listings.
const PREVIEW_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

/// Inspect a pagelog record or chunk log file.
#[derive(Parser, Debug)]
#[command(name = "pagelog-inspect", version = VERSION, about = "Inspect pagelog files")]
struct Cli {
    /// Log file to inspect.
    path: PathBuf,

    /// List entries (opens the log).
    #[arg(long)]
    entries: bool,

    /// Maximum number of entries to list.
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Hex dump of the bytes around the entry with this id (opens the log).
    #[arg(long)]
    dump: Option<i64>,

    /// Bytes shown on each side of the dumped entry.
    #[arg(long, default_value_t = 64)]
    width: u64,

    /// Print single-line JSON.
    #[arg(long)]
    compact: bool,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Report {
    path: PathBuf,
    kind: Option<LogKind>,
    magic: String,
    closed_properly: bool,
    header: HeaderSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<RecoverySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entries: Option<Vec<EntrySummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dump: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecoverySummary {
    was_recovery_needed: bool,
    recovered_region: Option<(u64, u64)>,
    abandoned_records: u64,
    rolled_back_chunks: u64,
}

#[derive(Debug, Serialize)]
struct EntrySummary {
    id: i64,
    len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    capacity: Option<u32>,
    preview: String,
}

fn preview(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(PREVIEW_BYTES)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn inspect(cli: &Cli) -> Result<Report, Box<dyn Error>> {
    let header = HeaderSnapshot::read(&cli.path)?
        .ok_or_else(|| format!("{} is missing or shorter than a log header", cli.path.display()))?;
    let kind = LogKind::from_magic_word(header.magic_word);

    let mut report = Report {
        path: cli.path.clone(),
        kind,
        magic: String::from_utf8_lossy(&header.magic_word.to_be_bytes()).into_owned(),
        closed_properly: header.was_closed_properly(),
        header,
        recovery: None,
        entries: None,
        dump: None,
    };
    if !cli.entries && cli.dump.is_none() {
        return Ok(report);
    }

    let kind = kind.ok_or_else(|| LogError::UnknownLogKind {
        path: cli.path.display().to_string(),
        found: report.header.magic_word,
    })?;
    let config = LogConfig::default().with_page_size(report.header.page_size);
    config.validate(kind.max_page_size())?;
    let log = PagedLog::open(&cli.path, kind, config)?;

    let recovery = log.recovery_info();
    report.recovery = Some(RecoverySummary {
        was_recovery_needed: recovery.was_recovery_needed(),
        recovered_region: recovery.recovered_region().map(|region| (region.start, region.end)),
        abandoned_records: recovery.abandoned_records(),
        rolled_back_chunks: recovery.rolled_back_chunks(),
    });

    if cli.entries {
        let mut entries = Vec::new();
        if cli.limit > 0 {
            match &log {
                PagedLog::Records(records) => records.for_each_record(|id, bytes| {
                    entries.push(EntrySummary {
                        id,
                        len: bytes.len(),
                        capacity: None,
                        preview: preview(bytes),
                    });
                    entries.len() < cli.limit
                })?,
                PagedLog::Chunks(chunks) => chunks.for_each_chunk(|chunk| {
                    entries.push(EntrySummary {
                        id: chunk.id(),
                        len: chunk.len() as usize,
                        capacity: Some(chunk.capacity()),
                        preview: preview(chunk.read()),
                    });
                    entries.len() < cli.limit
                })?,
            };
        }
        report.entries = Some(entries);
    }

    if let Some(id) = cli.dump {
        report.dump = Some(log.dump_around(id, cli.width)?);
    }

    log.close()?;
    Ok(report)
}

fn main() -> Result<(), Box<dyn Error>> {
    // Logs go to stderr so stdout stays valid JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::debug!(path = %cli.path.display(), "Inspecting log file");

    let report = inspect(&cli)?;
    let json = if cli.compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };
    println!("{json}");
    Ok(())
}
