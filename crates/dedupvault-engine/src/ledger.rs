//! Storage ledger: dedup accounting recomputed from the full record set.
//!
//! Snapshots are built off to the side and published by swapping an `Arc`,
//! so readers always see a complete aggregate.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::content_index::ContentIndex;
use crate::error::Result;
use crate::record::{FileRecord, Timestamp};
use crate::record_store::RecordStore;

/// Aggregate counts and byte totals describing deduplication effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Number of records.
    pub total_files: u64,
    /// Number of canonical records.
    pub unique_files: u64,
    /// Number of duplicate records.
    pub duplicate_files: u64,
    /// Sum of sizes over all records.
    pub total_logical_bytes: u64,
    /// Sum of sizes over canonical records (bytes actually held).
    pub actual_bytes: u64,
    /// `total_logical_bytes - actual_bytes`.
    pub bytes_saved: u64,
    /// When this snapshot was computed.
    pub computed_at: Timestamp,
}

impl LedgerSnapshot {
    /// Aggregate a record set. Byte totals saturate at `u64::MAX`.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a FileRecord>,
    {
        let mut snapshot = LedgerSnapshot {
            computed_at: Timestamp::now(),
            ..Default::default()
        };
        for record in records {
            snapshot.total_files += 1;
            snapshot.total_logical_bytes =
                snapshot.total_logical_bytes.saturating_add(record.size_bytes);
            if record.is_duplicate {
                snapshot.duplicate_files += 1;
            } else {
                snapshot.unique_files += 1;
                snapshot.actual_bytes = snapshot.actual_bytes.saturating_add(record.size_bytes);
            }
        }
        snapshot.bytes_saved = snapshot
            .total_logical_bytes
            .saturating_sub(snapshot.actual_bytes);
        snapshot
    }

    /// Logical bytes per stored byte; 1.0 when nothing is stored.
    pub fn dedup_ratio(&self) -> f64 {
        if self.actual_bytes > 0 {
            self.total_logical_bytes as f64 / self.actual_bytes as f64
        } else {
            1.0
        }
    }
}

/// Holds the last published snapshot.
pub struct StorageLedger {
    current: RwLock<Arc<LedgerSnapshot>>,
    recompute_lock: Mutex<()>,
}

impl Default for StorageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageLedger {
    /// Ledger with an empty snapshot.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(LedgerSnapshot::default())),
            recompute_lock: Mutex::new(()),
        }
    }

    /// Last published snapshot, without recomputing.
    pub fn current(&self) -> Arc<LedgerSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Scan every record, build a new snapshot and publish it.
    pub fn recompute(&self, records: &RecordStore) -> Result<Arc<LedgerSnapshot>> {
        // Serialized so a slower, older scan never overwrites a newer snapshot.
        let _serial = self.recompute_lock.lock();
        let all = records.all()?;
        let snapshot = Arc::new(LedgerSnapshot::from_records(&all));
        *self.current.write() = Arc::clone(&snapshot);
        debug!(
            total = snapshot.total_files,
            unique = snapshot.unique_files,
            saved = snapshot.bytes_saved,
            "Ledger recomputed"
        );
        Ok(snapshot)
    }
}

/// Bytes saved thanks to `record`: its size times its duplicate count if canonical, else 0.
///
/// Saturates at `u64::MAX`.
pub fn storage_saved(record: &FileRecord, index: &ContentIndex) -> Result<u64> {
    if record.is_duplicate {
        return Ok(0);
    }
    let duplicates = index.duplicate_count(&record.id)? as u64;
    Ok(record.size_bytes.saturating_mul(duplicates))
}
