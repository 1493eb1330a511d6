//! Property-based tests: dedup invariants hold across arbitrary ingest/delete sequences.

mod common;

use common::assert_dedup_invariants;
use dedupvault_engine::{
    DedupEngine, DedupError, DeletePolicy, EngineConfig, Fingerprinter, HashAlgorithm, RecordId,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Ingest(u8),
    Delete(usize),
}

fn any_op() -> impl Strategy<Value = Op> {
    // A small content alphabet makes duplicates common.
    prop_oneof![
        3 => (0u8..5).prop_map(Op::Ingest),
        1 => any::<usize>().prop_map(Op::Delete),
    ]
}

fn any_policy() -> impl Strategy<Value = DeletePolicy> {
    prop_oneof![Just(DeletePolicy::Forbid), Just(DeletePolicy::PromoteOldest)]
}

fn content(tag: u8) -> Vec<u8> {
    vec![tag; tag as usize * 3 + 1]
}

proptest! {
    #[test]
    fn prop_invariants_hold_after_any_sequence(
        ops in prop::collection::vec(any_op(), 1..40),
        policy in any_policy(),
    ) {
        let config = EngineConfig { delete_policy: policy, ..EngineConfig::default() };
        let engine = DedupEngine::in_memory(config).unwrap();
        let mut live: Vec<RecordId> = Vec::new();

        for op in ops {
            match op {
                Op::Ingest(tag) => {
                    let record = engine.ingest_bytes(&content(tag), format!("t{}", tag), "").unwrap();
                    live.push(record.id);
                }
                Op::Delete(pick) if !live.is_empty() => {
                    let id = live[pick % live.len()];
                    match engine.delete(&id) {
                        Ok(_) => live.retain(|l| *l != id),
                        Err(DedupError::HasDuplicates { .. }) => {
                            prop_assert_eq!(policy, DeletePolicy::Forbid);
                        }
                        Err(e) => prop_assert!(false, "unexpected delete error: {}", e),
                    }
                }
                Op::Delete(_) => {}
            }
        }

        assert_dedup_invariants(&engine);
        prop_assert_eq!(engine.list().unwrap().len(), live.len());
    }

    #[test]
    fn prop_same_bytes_same_digest(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Blake3] {
            let whole = Fingerprinter::new(algorithm, 4096).fingerprint_bytes(&data);
            let (streamed, len) = Fingerprinter::new(algorithm, 7)
                .fingerprint_reader(&data[..])
                .unwrap();
            prop_assert_eq!(whole, streamed);
            prop_assert_eq!(len, data.len() as u64);
        }
    }

    #[test]
    fn prop_storage_saved_sums_to_ledger(tags in prop::collection::vec(0u8..6, 1..30)) {
        let engine = DedupEngine::in_memory(EngineConfig::default()).unwrap();
        for (i, tag) in tags.iter().enumerate() {
            engine.ingest_bytes(&content(*tag), format!("f{}", i), "").unwrap();
        }
        let saved: u64 = engine
            .list()
            .unwrap()
            .iter()
            .map(|r| engine.storage_saved(&r.id).unwrap())
            .sum();
        prop_assert_eq!(saved, engine.statistics().unwrap().bytes_saved);
    }
}
