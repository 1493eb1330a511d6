//! Content index: digest → canonical record lookups.
//!
//! The `canon/<digest>` key exists iff a canonical record for that digest
//! exists, so the lookup is a single point read on every ingest.

use tracing::debug;

use crate::error::{DedupError, Result};
use crate::fingerprint::Digest;
use crate::record::{FileRecord, RecordId};
use crate::record_store::RecordStore;

/// Authority for "is this content new".
#[derive(Clone)]
pub struct ContentIndex {
    records: RecordStore,
}

impl ContentIndex {
    /// Build an index view over `records`.
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }

    /// The unique non-duplicate record holding `digest`, if any.
    pub fn find_canonical(&self, digest: &Digest) -> Result<Option<FileRecord>> {
        let Some(id) = self.records.canonical_id(digest)? else {
            debug!(digest = %digest, "Content index miss");
            return Ok(None);
        };
        let record = self.records.get(&id)?.ok_or_else(|| {
            DedupError::StorageFailure(format!(
                "content index for {} names missing record {}",
                digest, id
            ))
        })?;
        if record.is_duplicate || record.digest != *digest {
            return Err(DedupError::StorageFailure(format!(
                "content index for {} names non-canonical record {}",
                digest, id
            )));
        }
        debug!(digest = %digest, canonical = %id, "Content index hit");
        Ok(Some(record))
    }

    /// Duplicates currently referencing `canonical`.
    pub fn duplicates_of(&self, canonical: &RecordId) -> Result<Vec<FileRecord>> {
        let mut duplicates = Vec::new();
        for id in self.records.duplicate_ids(canonical)? {
            let record = self.records.get(&id)?.ok_or_else(|| {
                DedupError::StorageFailure(format!(
                    "reference from {} to missing duplicate {}",
                    canonical, id
                ))
            })?;
            duplicates.push(record);
        }
        Ok(duplicates)
    }

    /// Number of duplicates referencing `canonical`.
    pub fn duplicate_count(&self, canonical: &RecordId) -> Result<usize> {
        Ok(self.records.duplicate_ids(canonical)?.len())
    }
}
