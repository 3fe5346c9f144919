// SPDX-License-Identifier: PMPL-1.0-or-later
//! Integration tests for pagelog
//!
//! Exercises both log kinds through their public API: durability across
//! reopen, the page-size scenario, unclean shutdowns and concurrent use.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pagelog::{
    AppendOnlyLog, ChunkedLog, LogConfig, LogError, LogKind, PagedLog, SyncMode,
    DEFAULT_PAGE_SIZE,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn small_pages() -> LogConfig {
    LogConfig::default().with_page_size(4096)
}

fn payload_for(index: usize) -> Vec<u8> {
    format!("record-{index}-{}", "x".repeat(index % 97)).into_bytes()
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

#[test]
fn test_records_survive_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("records.log");

    let log = AppendOnlyLog::open(&path, small_pages()).unwrap();
    let ids: Vec<i64> = (0..1000).map(|i| log.append(&payload_for(i)).unwrap()).collect();
    let count = log.records_count();
    log.close().unwrap();

    let log = AppendOnlyLog::open(&path, small_pages()).unwrap();
    assert!(log.was_closed_properly());
    assert!(!log.was_recovery_needed());
    assert_eq!(log.records_count(), count);
    assert_eq!(count, 1000);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(log.read_to_vec(*id).unwrap(), payload_for(i));
    }

    // Appends continue after the last record.
    let next = log.append(b"more").unwrap();
    assert!(next > *ids.last().unwrap());
    log.close().unwrap();
}

#[test]
fn test_chunks_survive_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chunks.log");

    // Ten bytes each, "chunk-0000" to "chunk-0199".
    let contents = |i: usize| format!("chunk-{i:04}").into_bytes();

    let log = ChunkedLog::open(&path, small_pages()).unwrap();
    let mut ids = Vec::new();
    for i in 0..200usize {
        let chunk = log.append(64).unwrap();
        assert!(chunk.append_bytes(&contents(i)));
        ids.push(chunk.id());
    }
    log.close().unwrap();

    let log = ChunkedLog::open(&path, small_pages()).unwrap();
    assert_eq!(log.chunks_count(), 200);
    for (i, id) in ids.iter().enumerate() {
        let chunk = log.read(*id).unwrap();
        assert_eq!(chunk.read(), contents(i).as_slice());
        assert_eq!(chunk.len(), 10);
    }
}

#[test]
fn test_unclean_shutdown_keeps_committed_records() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("records.log");

    let log = AppendOnlyLog::open(&path, small_pages()).unwrap();
    let id = log.append(b"written before the crash").unwrap();
    // Dropped without close: the status word still says "open".
    drop(log);

    let log = AppendOnlyLog::open(&path, small_pages()).unwrap();
    assert!(!log.was_closed_properly());
    assert!(!log.was_recovery_needed());
    assert_eq!(log.records_count(), 1);
    assert_eq!(log.read_to_vec(id).unwrap(), b"written before the crash");
    log.close().unwrap();

    let log = AppendOnlyLog::open(&path, small_pages()).unwrap();
    assert!(log.was_closed_properly());
}

// ---------------------------------------------------------------------------
// Page size scenario
// ---------------------------------------------------------------------------

#[test]
fn test_default_page_size_scenario() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = AppendOnlyLog::open(dir.path().join("records.log"), LogConfig::default()).unwrap();
    assert_eq!(log.page_size(), DEFAULT_PAGE_SIZE);

    let id = log.append(b"test data").unwrap();
    assert_eq!(log.read_to_vec(id).unwrap(), b"test data");

    let largest = vec![0xC3u8; DEFAULT_PAGE_SIZE as usize - 4];
    let id = log.append(&largest).unwrap();
    assert_eq!(log.read_to_vec(id).unwrap(), largest);

    let too_large = vec![0u8; DEFAULT_PAGE_SIZE as usize - 4 + 1];
    match log.append(&too_large) {
        Err(LogError::PayloadTooLarge { size, max, page_size }) => {
            assert_eq!(size, u64::from(DEFAULT_PAGE_SIZE) - 3);
            assert_eq!(max, DEFAULT_PAGE_SIZE - 4);
            assert_eq!(page_size, DEFAULT_PAGE_SIZE);
        }
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }
    assert_eq!(log.records_count(), 2);
}

#[test]
fn test_sync_modes() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    for (name, mode) in [
        ("fsync", SyncMode::Fsync),
        ("periodic", SyncMode::Periodic(Duration::from_millis(1))),
        ("async", SyncMode::Async),
    ] {
        let config = small_pages().with_sync_mode(mode);
        let records = AppendOnlyLog::open(dir.path().join(format!("{name}.records")), config.clone()).unwrap();
        for i in 0..50 {
            records.append(&payload_for(i)).unwrap();
        }
        records.sync().unwrap();
        assert_eq!(records.records_count(), 50);
        records.close().unwrap();

        let chunks = ChunkedLog::open(dir.path().join(format!("{name}.chunks")), config).unwrap();
        let chunk = chunks.append(100).unwrap();
        assert!(chunk.append_bytes(b"synced"));
        assert_eq!(chunk.read(), b"synced");
        drop(chunk);
        chunks.close().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_record_appends() {
    init_tracing();
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let dir = TempDir::new().unwrap();
    let log = AppendOnlyLog::open(dir.path().join("records.log"), small_pages()).unwrap();

    let per_thread_ids: Vec<Vec<i64>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|thread| {
                let log = &log;
                scope.spawn(move || {
                    (0..PER_THREAD)
                        .map(|seq| log.append(format!("{thread}:{seq}").as_bytes()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let all: HashSet<i64> = per_thread_ids.iter().flatten().copied().collect();
    assert_eq!(all.len(), THREADS * PER_THREAD);
    for ids in &per_thread_ids {
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }
    assert_eq!(log.records_count(), (THREADS * PER_THREAD) as u64);

    // Visitation follows id order, and each thread's records appear in the
    // order that thread wrote them.
    let mut last_id = 0;
    let mut next_seq = [0usize; THREADS];
    log.for_each_record(|id, bytes| {
        assert!(id > last_id);
        last_id = id;
        let text = std::str::from_utf8(bytes).unwrap();
        let (thread, seq) = text.split_once(':').unwrap();
        let thread: usize = thread.parse().unwrap();
        assert_eq!(seq.parse::<usize>().unwrap(), next_seq[thread]);
        next_seq[thread] += 1;
        true
    })
    .unwrap();
    assert_eq!(next_seq, [PER_THREAD; THREADS]);
}

#[test]
fn test_readers_run_alongside_appenders() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = AppendOnlyLog::open(dir.path().join("records.log"), small_pages()).unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..2000 {
                log.append(&payload_for(i)).unwrap();
            }
            done.store(true, Ordering::Release);
        });
        for _ in 0..2 {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let mut index = 0;
                    log.for_each_record(|_, bytes| {
                        assert_eq!(bytes, payload_for(index).as_slice());
                        index += 1;
                        true
                    })
                    .unwrap();
                }
            });
        }
    });
    assert_eq!(log.records_count(), 2000);
}

#[test]
fn test_concurrent_chunk_reservations_and_appends() {
    init_tracing();
    const THREADS: u8 = 6;

    let dir = TempDir::new().unwrap();
    let log = ChunkedLog::open(dir.path().join("chunks.log"), small_pages()).unwrap();
    let shared = log.append(THREADS as u32 * 200).unwrap();

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let log = &log;
            let shared = shared.clone();
            scope.spawn(move || {
                for _ in 0..100 {
                    assert!(shared.append(2, |buffer| buffer.fill(thread)));
                    let own = log.append(16).unwrap();
                    assert!(own.append_bytes(&[thread; 16]));
                }
            });
        }
    });

    assert!(shared.is_full());
    let mut counts = [0usize; THREADS as usize];
    for pair in shared.read().chunks(2) {
        assert_eq!(pair[0], pair[1]);
        counts[pair[0] as usize] += 2;
    }
    assert_eq!(counts, [200; THREADS as usize]);

    assert_eq!(log.chunks_count(), 1 + 100 * THREADS as u64);
    let mut seen = 0;
    log.for_each_chunk(|chunk| {
        if chunk.id() != shared.id() {
            let first = chunk.read()[0];
            assert!(chunk.read().iter().all(|byte| *byte == first));
        }
        seen += 1;
        true
    })
    .unwrap();
    assert_eq!(seen, 1 + 100 * THREADS as usize);
}

// ---------------------------------------------------------------------------
// Format checks and the factory
// ---------------------------------------------------------------------------

#[test]
fn test_factory_opens_both_kinds() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let records = dir.path().join("records.log");
    let chunks = dir.path().join("chunks.log");

    let log = PagedLog::open(&records, LogKind::Records, small_pages()).unwrap();
    log.as_records().unwrap().append(b"one").unwrap();
    log.set_user_header_field(2, 0xBEEF).unwrap();
    log.close().unwrap();
    PagedLog::open(&chunks, LogKind::Chunks, small_pages())
        .unwrap()
        .close()
        .unwrap();

    let log = PagedLog::open_existing(&records, small_pages()).unwrap();
    assert_eq!(log.kind(), LogKind::Records);
    assert_eq!(log.entries_count(), 1);
    assert_eq!(log.user_header_field(2).unwrap(), 0xBEEF);
    log.close().unwrap();

    let log = PagedLog::open_existing(&chunks, small_pages()).unwrap();
    assert_eq!(log.kind(), LogKind::Chunks);
    assert!(log.is_empty());

    assert!(matches!(
        AppendOnlyLog::open(&chunks, small_pages()),
        Err(LogError::MagicMismatch { .. })
    ));
}
