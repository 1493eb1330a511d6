//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dedupvault_engine::{
    BatchOp, DedupEngine, EngineConfig, FileRecord, KvStore, MemoryKvStore, StoreError,
};

/// Durable config rooted in a test directory, auto-checkpointing often.
pub fn durable_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        checkpoint_interval: 8,
        ..EngineConfig::with_data_dir(dir)
    }
}

/// KV backend whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyKvStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
}

impl FlakyKvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl KvStore for FlakyKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.inner.scan_prefix(prefix)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.write_batch(ops)
    }
}

/// Check the structural dedup invariants over every record in `engine`.
pub fn assert_dedup_invariants(engine: &DedupEngine) {
    let records = engine.list().unwrap();
    let by_id: HashMap<_, &FileRecord> = records.iter().map(|r| (r.id, r)).collect();

    let mut canonical_per_digest: HashMap<_, usize> = HashMap::new();
    for record in &records {
        if record.is_duplicate {
            let target = record.canonical_ref.expect("duplicate without canonical_ref");
            let canonical = by_id.get(&target).expect("duplicate references missing record");
            assert!(!canonical.is_duplicate, "duplicate chain via {}", record.id);
            assert_eq!(canonical.digest, record.digest);
            assert_eq!(canonical.size_bytes, record.size_bytes);
        } else {
            assert!(record.canonical_ref.is_none());
            *canonical_per_digest.entry(record.digest).or_default() += 1;
        }
    }
    for (digest, count) in canonical_per_digest {
        assert_eq!(count, 1, "digest {} has {} canonical records", digest, count);
    }

    let stats = engine.statistics().unwrap();
    assert_eq!(stats.total_files, records.len() as u64);
    assert_eq!(stats.unique_files + stats.duplicate_files, stats.total_files);
    assert_eq!(
        stats.actual_bytes + stats.bytes_saved,
        stats.total_logical_bytes
    );

    let report = engine.verify().unwrap();
    assert!(report.is_clean(), "integrity issues: {:?}", report.issues);
}
