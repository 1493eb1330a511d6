//! Offline consistency check over records, index keys and blobs.
//!
//! Read-only: issues are reported, never repaired. Records and index keys are
//! read in one consistent scan. Blob findings are re-checked inside the
//! digest's critical section, so an ingest or delete in flight is not reported.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::blob::BlobStore;
use crate::error::Result;
use crate::fingerprint::Digest;
use crate::record::{FileRecord, RecordId};
use crate::record_store::RecordStore;
use crate::resolver::DigestLocks;

/// One inconsistency between records, index keys and stored content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// A canonical record has no `canon/` key.
    MissingIndexKey {
        /// The canonical record.
        id: RecordId,
        /// Its digest.
        digest: Digest,
    },
    /// A `canon/` key names something other than a canonical record with that digest.
    StaleIndexKey {
        /// Digest of the key.
        digest: Digest,
        /// Id the key points at.
        target: RecordId,
    },
    /// More than one canonical record shares a digest.
    MultipleCanonical {
        /// The shared digest.
        digest: Digest,
        /// Every canonical record holding it.
        ids: Vec<RecordId>,
    },
    /// A duplicate references a record that does not exist.
    DanglingReference {
        /// The duplicate.
        id: RecordId,
        /// Missing target.
        canonical: RecordId,
    },
    /// A duplicate references another duplicate.
    ReferenceChain {
        /// The duplicate.
        id: RecordId,
        /// The duplicate it points at.
        target: RecordId,
    },
    /// A duplicate's digest differs from its canonical record's.
    DigestMismatch {
        /// The duplicate.
        id: RecordId,
        /// Its canonical record.
        canonical: RecordId,
    },
    /// A duplicate has no `ref/` key under its canonical record.
    MissingReverseRef {
        /// The duplicate.
        id: RecordId,
        /// Its canonical record.
        canonical: RecordId,
    },
    /// A `ref/` key without a matching duplicate record.
    StaleReverseRef {
        /// Canonical id in the key.
        canonical: RecordId,
        /// Duplicate id in the key.
        duplicate: RecordId,
    },
    /// A canonical record whose content is missing from the blob store.
    MissingBlob {
        /// The canonical record.
        id: RecordId,
        /// Its digest.
        digest: Digest,
    },
    /// Stored content that no canonical record owns.
    OrphanBlob {
        /// Digest of the blob.
        digest: Digest,
    },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::MissingIndexKey { id, digest } => {
                write!(f, "canonical record {} has no index key for {}", id, digest)
            }
            IntegrityIssue::StaleIndexKey { digest, target } => {
                write!(f, "index key {} points at non-canonical {}", digest, target)
            }
            IntegrityIssue::MultipleCanonical { digest, ids } => {
                write!(f, "{} canonical records for {}", ids.len(), digest)
            }
            IntegrityIssue::DanglingReference { id, canonical } => {
                write!(f, "duplicate {} references missing record {}", id, canonical)
            }
            IntegrityIssue::ReferenceChain { id, target } => {
                write!(f, "duplicate {} references duplicate {}", id, target)
            }
            IntegrityIssue::DigestMismatch { id, canonical } => {
                write!(f, "duplicate {} digest differs from canonical {}", id, canonical)
            }
            IntegrityIssue::MissingReverseRef { id, canonical } => {
                write!(f, "duplicate {} missing reverse reference from {}", id, canonical)
            }
            IntegrityIssue::StaleReverseRef {
                canonical,
                duplicate,
            } => write!(
                f,
                "reverse reference {} -> {} has no matching duplicate",
                canonical, duplicate
            ),
            IntegrityIssue::MissingBlob { id, digest } => {
                write!(f, "content {} for canonical {} is missing", digest, id)
            }
            IntegrityIssue::OrphanBlob { digest } => {
                write!(f, "content {} is stored but has no canonical record", digest)
            }
        }
    }
}

/// Result of an integrity check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Records examined.
    pub records_checked: u64,
    /// Everything found wrong.
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    /// True when no issues were found.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Cross-check every record against the index keys and, if given, the blob store.
///
/// `locks` must be the table the writers use.
pub fn verify(
    records: &RecordStore,
    blobs: Option<&BlobStore>,
    locks: &DigestLocks,
) -> Result<IntegrityReport> {
    let snapshot = records.snapshot()?;
    let all = snapshot.records;
    let by_id: HashMap<RecordId, &FileRecord> = all.iter().map(|r| (r.id, r)).collect();
    let mut report = IntegrityReport {
        records_checked: all.len() as u64,
        ..Default::default()
    };

    let index: HashMap<Digest, RecordId> = snapshot.canonical.into_iter().collect();
    let refs: HashSet<(RecordId, RecordId)> = snapshot.reverse_refs.into_iter().collect();

    let mut canonical_by_digest: HashMap<Digest, Vec<RecordId>> = HashMap::new();
    for record in all.iter().filter(|r| r.is_canonical()) {
        canonical_by_digest
            .entry(record.digest)
            .or_default()
            .push(record.id);
        if index.get(&record.digest) != Some(&record.id) {
            report.issues.push(IntegrityIssue::MissingIndexKey {
                id: record.id,
                digest: record.digest,
            });
        }
    }

    for (digest, mut ids) in canonical_by_digest {
        if ids.len() > 1 {
            ids.sort();
            report
                .issues
                .push(IntegrityIssue::MultipleCanonical { digest, ids });
        }
    }

    for (digest, target) in &index {
        let valid = by_id
            .get(target)
            .map(|r| r.is_canonical() && r.digest == *digest)
            .unwrap_or(false);
        if !valid {
            report.issues.push(IntegrityIssue::StaleIndexKey {
                digest: *digest,
                target: *target,
            });
        }
    }

    for record in all.iter().filter(|r| r.is_duplicate) {
        let Some(canonical) = record.canonical_ref else {
            report.issues.push(IntegrityIssue::DanglingReference {
                id: record.id,
                canonical: RecordId::nil(),
            });
            continue;
        };
        match by_id.get(&canonical) {
            None => report.issues.push(IntegrityIssue::DanglingReference {
                id: record.id,
                canonical,
            }),
            Some(target) if target.is_duplicate => {
                report.issues.push(IntegrityIssue::ReferenceChain {
                    id: record.id,
                    target: canonical,
                })
            }
            Some(target) if target.digest != record.digest => {
                report.issues.push(IntegrityIssue::DigestMismatch {
                    id: record.id,
                    canonical,
                })
            }
            Some(_) => {}
        }
        if !refs.contains(&(canonical, record.id)) {
            report.issues.push(IntegrityIssue::MissingReverseRef {
                id: record.id,
                canonical,
            });
        }
    }

    for (canonical, duplicate) in &refs {
        let matches = by_id
            .get(duplicate)
            .map(|r| r.canonical_ref == Some(*canonical))
            .unwrap_or(false);
        if !matches {
            report.issues.push(IntegrityIssue::StaleReverseRef {
                canonical: *canonical,
                duplicate: *duplicate,
            });
        }
    }

    if let Some(blobs) = blobs {
        check_blobs(records, blobs, locks, &all, &mut report)?;
    }

    if report.is_clean() {
        debug!(records = report.records_checked, "Integrity check clean");
    } else {
        for issue in &report.issues {
            warn!(%issue, "Integrity issue");
        }
    }
    Ok(report)
}

/// Compare canonical records with the blob directory.
///
/// Candidates come from the snapshot and a directory listing taken at different moments.
/// Each one is confirmed against the live store while its digest is locked.
fn check_blobs(
    records: &RecordStore,
    blobs: &BlobStore,
    locks: &DigestLocks,
    all: &[FileRecord],
    report: &mut IntegrityReport,
) -> Result<()> {
    for record in all.iter().filter(|r| r.is_canonical()) {
        if blobs.contains(&record.digest) {
            continue;
        }
        let _guard = locks.lock(&record.digest);
        let still_canonical = records
            .get(&record.id)?
            .map(|r| r.is_canonical())
            .unwrap_or(false);
        if still_canonical && !blobs.contains(&record.digest) {
            report.issues.push(IntegrityIssue::MissingBlob {
                id: record.id,
                digest: record.digest,
            });
        }
    }

    let owned: HashSet<Digest> = all
        .iter()
        .filter(|r| r.is_canonical())
        .map(|r| r.digest)
        .collect();
    for digest in blobs.digests()? {
        if owned.contains(&digest) {
            continue;
        }
        let _guard = locks.lock(&digest);
        if records.canonical_id(&digest)?.is_none() && blobs.contains(&digest) {
            report.issues.push(IntegrityIssue::OrphanBlob { digest });
        }
    }
    Ok(())
}
