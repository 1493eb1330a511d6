//! Concurrent uploads of identical and distinct content.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{assert_dedup_invariants, durable_config};
use dedupvault_engine::{DedupEngine, DeletePolicy, EngineConfig};
use tempfile::tempdir;

const UPLOADERS: usize = 16;

#[test]
fn test_threads_racing_on_same_content() {
    let engine = Arc::new(DedupEngine::in_memory(EngineConfig::default()).unwrap());
    let barrier = Arc::new(Barrier::new(UPLOADERS));

    let handles: Vec<_> = (0..UPLOADERS)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .ingest_bytes(b"the same bytes", format!("upload-{}", i), "")
                    .unwrap()
            })
        })
        .collect();
    let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let canonical: Vec<_> = records.iter().filter(|r| r.is_canonical()).collect();
    assert_eq!(canonical.len(), 1);
    for record in records.iter().filter(|r| r.is_duplicate) {
        assert_eq!(record.canonical_ref, Some(canonical[0].id));
    }
    let stats = engine.statistics().unwrap();
    assert_eq!(stats.unique_files, 1);
    assert_eq!(stats.duplicate_files, (UPLOADERS - 1) as u64);
    assert_dedup_invariants(&engine);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_tasks_racing_with_blobs() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(DedupEngine::open(durable_config(dir.path())).unwrap());

    let mut tasks = Vec::new();
    for i in 0..UPLOADERS {
        let engine = Arc::clone(&engine);
        tasks.push(tokio::task::spawn_blocking(move || {
            // Two distinct contents, each uploaded by half the tasks.
            let content = if i % 2 == 0 { &b"even"[..] } else { &b"odd"[..] };
            engine.ingest_bytes(content, format!("task-{}", i), "")
        }));
    }
    let mut records = Vec::new();
    for task in tasks {
        records.push(task.await.unwrap().unwrap());
    }

    assert_eq!(records.iter().filter(|r| r.is_canonical()).count(), 2);
    let blobs: usize = std::fs::read_dir(dir.path().join("blobs"))
        .unwrap()
        .map(|shard| std::fs::read_dir(shard.unwrap().path()).unwrap().count())
        .sum();
    assert_eq!(blobs, 2);
    assert_dedup_invariants(&engine);
}

#[test]
fn test_ingest_and_delete_interleaved() {
    let engine = Arc::new(DedupEngine::in_memory(EngineConfig::default()).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for round in 0..20 {
                    let record = engine
                        .ingest_bytes(format!("payload {}", round % 3).as_bytes(), format!("w{}", i), "")
                        .unwrap();
                    // Duplicates can always go; canonical deletes may be refused.
                    if record.is_duplicate {
                        engine.delete(&record.id).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_dedup_invariants(&engine);
}

#[test]
fn test_verify_while_uploads_and_deletes_run() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        delete_policy: DeletePolicy::PromoteOldest,
        ..durable_config(dir.path())
    };
    let engine = Arc::new(DedupEngine::open(config).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for round in 0..60 {
                    let content = format!("churn {}", round % 4);
                    let record = engine
                        .ingest_bytes(content.as_bytes(), format!("w{}-{}", w, round), "")
                        .unwrap();
                    // Every other upload is removed again, canonical or not.
                    if round % 2 == 1 {
                        engine.delete(&record.id).unwrap();
                    }
                }
            })
        })
        .collect();

    let mut checks = 0;
    while writers.iter().any(|w| !w.is_finished()) || checks < 10 {
        let report = engine.verify().unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
        checks += 1;
    }
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(engine.list().unwrap().len(), 4 * 30);
    assert_dedup_invariants(&engine);
}
