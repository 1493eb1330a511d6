//! End-to-end ingest, lookup, statistics and delete behaviour of `DedupEngine`.

mod common;

use std::io::Read;
use std::sync::Arc;

use common::{assert_dedup_invariants, durable_config, FlakyKvStore};
use dedupvault_engine::{
    DedupEngine, DedupError, DeleteOutcome, DeletePolicy, EngineConfig, ErrorKind, HashAlgorithm,
    IngestMeta,
};
use tempfile::tempdir;

#[test]
fn test_same_content_twice() {
    let engine = DedupEngine::in_memory(EngineConfig::default()).unwrap();
    let a = engine.ingest_bytes(b"hello", "a.txt", "text/plain").unwrap();
    let b = engine.ingest_bytes(b"hello", "b.txt", "text/plain").unwrap();

    assert!(!a.is_duplicate);
    assert!(b.is_duplicate);
    assert_eq!(b.canonical_ref, Some(a.id));
    assert_eq!(
        a.digest.to_hex(),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );

    let stats = engine.statistics().unwrap();
    assert_eq!(stats.total_files, 2);
    assert_eq!(stats.unique_files, 1);
    assert_eq!(stats.duplicate_files, 1);
    assert_eq!(stats.total_logical_bytes, 10);
    assert_eq!(stats.actual_bytes, 5);
    assert_eq!(stats.bytes_saved, 5);
    assert_dedup_invariants(&engine);
}

#[test]
fn test_distinct_contents_save_nothing() {
    let engine = DedupEngine::in_memory(EngineConfig::default()).unwrap();
    for (i, size) in [10usize, 20, 30].into_iter().enumerate() {
        let data = vec![i as u8 + 1; size];
        engine.ingest_bytes(&data, format!("f{}", i), "").unwrap();
    }

    let stats = engine.statistics().unwrap();
    assert_eq!(stats.total_files, 3);
    assert_eq!(stats.unique_files, 3);
    assert_eq!(stats.duplicate_files, 0);
    assert_eq!(stats.bytes_saved, 0);
    assert_eq!(stats.total_logical_bytes, 60);
}

#[test]
fn test_repeat_references_first_not_latest() {
    let engine = DedupEngine::in_memory(EngineConfig::default()).unwrap();
    let x = b"content x, which is longer".to_vec();
    let first = engine.ingest_bytes(&x, "x1", "").unwrap();
    let second = engine.ingest_bytes(b"content y", "y", "").unwrap();
    let third = engine.ingest_bytes(&x, "x2", "").unwrap();

    assert_eq!(third.canonical_ref, Some(first.id));
    assert_eq!(engine.storage_saved(&first.id).unwrap(), x.len() as u64);
    assert_eq!(engine.storage_saved(&second.id).unwrap(), 0);
    assert_eq!(engine.storage_saved(&third.id).unwrap(), 0);
}

#[test]
fn test_content_survives_reopen() {
    let dir = tempdir().unwrap();
    let (first, dup) = {
        let engine = DedupEngine::open(durable_config(dir.path())).unwrap();
        let first = engine.ingest_bytes(b"persist me", "a", "text/plain").unwrap();
        let dup = engine.ingest_bytes(b"persist me", "b", "").unwrap();
        (first, dup)
    };

    let engine = DedupEngine::open(durable_config(dir.path())).unwrap();
    assert_eq!(engine.get(&first.id).unwrap(), first);
    assert_eq!(engine.get(&dup.id).unwrap().media_type, "application/octet-stream");
    assert_eq!(engine.current_statistics().total_files, 2);

    let mut content = String::new();
    engine
        .open_content(&dup.id)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "persist me");

    // New uploads after a restart still see the old canonical record.
    let again = engine.ingest_bytes(b"persist me", "c", "").unwrap();
    assert_eq!(again.canonical_ref, Some(first.id));
    assert!(again.created_at > dup.created_at);
    assert_dedup_invariants(&engine);
}

#[test]
fn test_many_writes_across_checkpoints() {
    let dir = tempdir().unwrap();
    let ids: Vec<_> = {
        let engine = DedupEngine::open(durable_config(dir.path())).unwrap();
        (0..40)
            .map(|i| {
                engine
                    .ingest_bytes(format!("blob {}", i % 7).as_bytes(), format!("n{}", i), "")
                    .unwrap()
                    .id
            })
            .collect()
    };
    let engine = DedupEngine::open(durable_config(dir.path())).unwrap();
    for id in &ids {
        engine.get(id).unwrap();
    }
    let stats = engine.statistics().unwrap();
    assert_eq!(stats.total_files, 40);
    assert_eq!(stats.unique_files, 7);
    engine.checkpoint().unwrap();
    assert_dedup_invariants(&engine);
}

#[test]
fn test_algorithm_mismatch_on_reopen() {
    let dir = tempdir().unwrap();
    DedupEngine::open(durable_config(dir.path())).unwrap();

    let config = EngineConfig {
        hash_algorithm: HashAlgorithm::Blake3,
        ..durable_config(dir.path())
    };
    let err = DedupEngine::open(config).err().unwrap();
    assert!(matches!(err, DedupError::Config(_)));
}

#[test]
fn test_blob_lifecycle() {
    let dir = tempdir().unwrap();
    let engine = DedupEngine::open(durable_config(dir.path())).unwrap();
    let blob_path = |hex: &str| dir.path().join("blobs").join(&hex[..2]).join(hex);

    let a = engine.ingest_bytes(b"shared bytes", "a", "").unwrap();
    let b = engine.ingest_bytes(b"shared bytes", "b", "").unwrap();
    let hex = a.digest.to_hex();
    assert!(blob_path(&hex).is_file());

    assert_eq!(
        engine.delete(&b.id).unwrap(),
        DeleteOutcome::Duplicate { canonical: a.id }
    );
    assert!(blob_path(&hex).is_file());

    assert_eq!(
        engine.delete(&a.id).unwrap(),
        DeleteOutcome::LastReference { digest: a.digest }
    );
    assert!(!blob_path(&hex).exists());
    assert!(matches!(
        engine.open_content(&a.id),
        Err(DedupError::NotFound(_))
    ));

    // Nothing left behind in the spool either.
    assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
}

#[test]
fn test_rejected_upload_leaves_no_blob_or_spool() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        max_ingest_bytes: Some(8),
        ..durable_config(dir.path())
    };
    let engine = DedupEngine::open(config).unwrap();

    let err = engine
        .ingest(&b"way more than eight bytes"[..], IngestMeta::new("big", ""))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(engine.list().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    assert_eq!(
        std::fs::read_dir(dir.path().join("blobs")).unwrap().count(),
        0
    );
}

#[test]
fn test_forbid_policy_keeps_everything() {
    let engine = DedupEngine::in_memory(EngineConfig::default()).unwrap();
    let a = engine.ingest_bytes(b"abc", "a", "").unwrap();
    let b = engine.ingest_bytes(b"abc", "b", "").unwrap();

    let err = engine.delete(&a.id).unwrap_err();
    assert!(matches!(
        err,
        DedupError::HasDuplicates { id, duplicates: 1 } if id == a.id
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(engine.get(&b.id).unwrap().canonical_ref, Some(a.id));
    assert_dedup_invariants(&engine);
}

#[test]
fn test_promote_policy_repoints_and_keeps_blob() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        delete_policy: DeletePolicy::PromoteOldest,
        ..durable_config(dir.path())
    };
    let engine = DedupEngine::open(config).unwrap();
    let a = engine.ingest_bytes(b"abc", "a", "").unwrap();
    let b = engine.ingest_bytes(b"abc", "b", "").unwrap();
    let c = engine.ingest_bytes(b"abc", "c", "").unwrap();

    assert_eq!(
        engine.delete(&a.id).unwrap(),
        DeleteOutcome::Promoted {
            new_canonical: b.id,
            repointed: 1,
        }
    );
    assert!(engine.get(&b.id).unwrap().is_canonical());
    assert_eq!(engine.get(&c.id).unwrap().canonical_ref, Some(b.id));
    assert_eq!(engine.storage_saved(&b.id).unwrap(), 3);

    let mut content = Vec::new();
    engine
        .open_content(&c.id)
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    assert_eq!(content, b"abc");

    let d = engine.ingest_bytes(b"abc", "d", "").unwrap();
    assert_eq!(d.canonical_ref, Some(b.id));
    assert_dedup_invariants(&engine);
}

#[test]
fn test_failed_commit_leaves_no_record() {
    let kv = FlakyKvStore::new();
    let engine = DedupEngine::with_store(kv.clone(), EngineConfig::default()).unwrap();
    let kept = engine.ingest_bytes(b"kept", "kept", "").unwrap();

    kv.fail_writes(true);
    let err = engine.ingest_bytes(b"lost", "lost", "").unwrap_err();
    assert!(matches!(err, DedupError::StorageFailure(_)));
    let err = engine.ingest_bytes(b"kept", "dup", "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageFailure);

    kv.fail_writes(false);
    let records = engine.list().unwrap();
    assert_eq!(records, vec![kept.clone()]);
    let retry = engine.ingest_bytes(b"lost", "lost", "").unwrap();
    assert!(retry.is_canonical());
    assert_dedup_invariants(&engine);
}

#[test]
fn test_ingest_path_uses_file_name() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("report.pdf");
    std::fs::write(&path, b"%PDF-1.4").unwrap();

    let engine = DedupEngine::in_memory(EngineConfig::default()).unwrap();
    let record = engine.ingest_path(&path, "application/pdf").unwrap();
    assert_eq!(record.display_name, "report.pdf");
    assert_eq!(record.size_bytes, 8);

    let missing = engine.ingest_path(&dir.path().join("absent"), "").unwrap_err();
    assert!(matches!(missing, DedupError::Io(_)));
}

#[test]
fn test_shared_engine_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>(_: &T) {}
    let engine = Arc::new(DedupEngine::in_memory(EngineConfig::default()).unwrap());
    assert_send_sync(&engine);
}
