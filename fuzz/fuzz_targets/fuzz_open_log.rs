// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target: arbitrary bytes as a log file must never make open, iteration
// or a following append panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pagelog::{AppendOnlyLog, ChunkedLog, LogConfig};

const PAGE: u32 = 4096;

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let config = LogConfig::default().with_page_size(PAGE);

    let records = dir.path().join("records.log");
    if std::fs::write(&records, data).is_ok() {
        if let Ok(log) = AppendOnlyLog::open(&records, config.clone()) {
            let _ = log.for_each_record(|id, bytes| {
                let _ = (id, bytes.len());
                true
            });
            let _ = log.append(data.get(..64).unwrap_or(data));
            let _ = log.close();
        }
    }

    let chunks = dir.path().join("chunks.log");
    if std::fs::write(&chunks, data).is_ok() {
        if let Ok(log) = ChunkedLog::open(&chunks, config) {
            let _ = log.for_each_chunk(|chunk| {
                let _ = chunk.read().len();
                true
            });
            if let Ok(chunk) = log.append(32) {
                let _ = chunk.append_bytes(b"fuzz");
            }
            let _ = log.close();
        }
    }
});
