//! Dedup resolution: decide canonical vs duplicate, atomically per digest.
//!
//! Every mutation for a digest (ingest or delete) runs inside that digest's
//! critical section. Callers with different digests never contend; callers
//! with the same digest are serialized, and whichever commits first becomes
//! canonical while later ones see it in the index and become its duplicates.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tracing::debug;

use crate::config::DeletePolicy;
use crate::content_index::ContentIndex;
use crate::error::{DedupError, Result};
use crate::fingerprint::Digest;
use crate::record::{FileRecord, MonotonicClock, RecordId, DEFAULT_MEDIA_TYPE};
use crate::record_store::RecordStore;

/// Per-digest mutual exclusion. Slots are created on demand and dropped once unused.
#[derive(Default)]
pub struct DigestLocks {
    slots: DashMap<Digest, Arc<Mutex<()>>>,
}

/// Holds a digest's critical section until dropped.
pub struct DigestGuard<'a> {
    locks: &'a DigestLocks,
    digest: Digest,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl DigestLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the critical section for `digest` is free, then enter it.
    pub fn lock(&self, digest: &Digest) -> DigestGuard<'_> {
        // The shard lock is released before blocking on the slot.
        let slot = self.slots.entry(*digest).or_default().clone();
        let guard = slot.lock_arc();
        DigestGuard {
            locks: self,
            digest: *digest,
            guard: Some(guard),
        }
    }

    /// Number of digests with a live slot (held or awaited).
    pub fn active(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for DigestGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own handle left means nobody holds or waits on the slot.
        self.locks
            .slots
            .remove_if(&self.digest, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Effects on content bytes that must happen inside the digest's critical section.
pub trait ContentHooks {
    /// Content for `digest` is new: persist it before the canonical record commits.
    fn persist_new(&mut self, _digest: &Digest) -> Result<()> {
        Ok(())
    }

    /// The canonical commit failed after `persist_new` succeeded.
    fn rollback_new(&mut self, _digest: &Digest) {}

    /// The last record referencing `digest` was deleted.
    fn release_last(&mut self, _digest: &Digest) {}
}

/// Hooks for accounting-only operation: no content bytes are kept.
pub struct NoContent;

impl ContentHooks for NoContent {}

/// Input to `DedupResolver::resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Digest of the full content.
    pub digest: Digest,
    /// Exact content length.
    pub size_bytes: u64,
    /// Caller-supplied name; must not be blank.
    pub display_name: String,
    /// Caller-supplied media type; blank means `application/octet-stream`.
    pub media_type: String,
}

impl ResolveRequest {
    /// Build a request from a parsed digest.
    pub fn new(
        digest: Digest,
        size_bytes: u64,
        display_name: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Self {
        Self {
            digest,
            size_bytes,
            display_name: display_name.into(),
            media_type: media_type.into(),
        }
    }

    /// Build a request from a hex digest, rejecting malformed digests.
    pub fn from_hex(
        digest: &str,
        size_bytes: u64,
        display_name: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::new(
            Digest::from_hex(digest)?,
            size_bytes,
            display_name,
            media_type,
        ))
    }

    fn normalize(mut self) -> Result<Self> {
        if self.display_name.trim().is_empty() {
            return Err(DedupError::InvalidInput(
                "display name must not be empty".to_string(),
            ));
        }
        if self.media_type.trim().is_empty() {
            self.media_type = DEFAULT_MEDIA_TYPE.to_string();
        }
        Ok(self)
    }
}

/// What a delete did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A duplicate was removed; its canonical record is untouched.
    Duplicate {
        /// Canonical record the duplicate referenced.
        canonical: RecordId,
    },
    /// The only record for this content was removed, and its content released.
    LastReference {
        /// Digest of the released content.
        digest: Digest,
    },
    /// A canonical record was removed and its oldest duplicate took over.
    Promoted {
        /// Former duplicate that is now canonical.
        new_canonical: RecordId,
        /// Remaining duplicates re-pointed at the new canonical record.
        repointed: usize,
    },
}

/// Creates records, classifying each as canonical or duplicate.
pub struct DedupResolver {
    records: RecordStore,
    index: ContentIndex,
    locks: DigestLocks,
    clock: MonotonicClock,
}

impl DedupResolver {
    /// Resolver over `records` with a fresh clock.
    pub fn new(records: RecordStore) -> Self {
        Self::with_clock(records, MonotonicClock::default())
    }

    /// Resolver issuing creation times from `clock`.
    pub fn with_clock(records: RecordStore, clock: MonotonicClock) -> Self {
        Self {
            index: ContentIndex::new(records.clone()),
            records,
            locks: DigestLocks::new(),
            clock,
        }
    }

    /// Per-digest lock table.
    pub fn locks(&self) -> &DigestLocks {
        &self.locks
    }

    /// Resolve without keeping content bytes.
    pub fn resolve(&self, request: ResolveRequest) -> Result<FileRecord> {
        self.resolve_with(request, &mut NoContent)
    }

    /// Create and persist a record for `request`.
    ///
    /// `hooks.persist_new` runs only when the content is new, inside the
    /// critical section and before the canonical record commits.
    pub fn resolve_with<H: ContentHooks + ?Sized>(
        &self,
        request: ResolveRequest,
        hooks: &mut H,
    ) -> Result<FileRecord> {
        let request = request.normalize()?;
        let _guard = self.locks.lock(&request.digest);

        if let Some(canonical) = self.index.find_canonical(&request.digest)? {
            if canonical.size_bytes != request.size_bytes {
                return Err(DedupError::InvalidInput(format!(
                    "size {} disagrees with {} bytes already stored for {}",
                    request.size_bytes, canonical.size_bytes, request.digest
                )));
            }
            let record = FileRecord::duplicate_of(
                &canonical,
                request.display_name,
                request.media_type,
                request.size_bytes,
                self.clock.now(),
            );
            self.records.insert_duplicate(&record)?;
            debug!(
                id = %record.id,
                canonical = %canonical.id,
                digest = %record.digest,
                "Committed duplicate record"
            );
            return Ok(record);
        }

        hooks.persist_new(&request.digest)?;
        let record = FileRecord::canonical(
            request.display_name,
            request.media_type,
            request.size_bytes,
            request.digest,
            self.clock.now(),
        );
        if let Err(e) = self.records.insert_canonical(&record) {
            hooks.rollback_new(&record.digest);
            return Err(e);
        }
        debug!(
            id = %record.id,
            digest = %record.digest,
            size = record.size_bytes,
            "Committed canonical record"
        );
        Ok(record)
    }

    /// Delete record `id` under `policy`.
    pub fn release<H: ContentHooks + ?Sized>(
        &self,
        id: &RecordId,
        policy: DeletePolicy,
        hooks: &mut H,
    ) -> Result<DeleteOutcome> {
        let digest = self
            .records
            .get(id)?
            .ok_or(DedupError::NotFound(*id))?
            .digest;
        let _guard = self.locks.lock(&digest);

        // Re-read inside the critical section; a concurrent delete may have won.
        let record = self.records.get(id)?.ok_or(DedupError::NotFound(*id))?;

        if let Some(canonical) = record.canonical_ref {
            self.records.remove(&record)?;
            debug!(id = %id, canonical = %canonical, "Removed duplicate record");
            return Ok(DeleteOutcome::Duplicate { canonical });
        }

        let mut duplicates = self.index.duplicates_of(id)?;
        if duplicates.is_empty() {
            self.records.remove(&record)?;
            hooks.release_last(&digest);
            debug!(id = %id, digest = %digest, "Removed last reference to content");
            return Ok(DeleteOutcome::LastReference { digest });
        }

        match policy {
            DeletePolicy::Forbid => Err(DedupError::HasDuplicates {
                id: *id,
                duplicates: duplicates.len(),
            }),
            DeletePolicy::PromoteOldest => {
                duplicates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                let mut heir = duplicates.remove(0);
                heir.is_duplicate = false;
                heir.canonical_ref = None;
                for other in duplicates.iter_mut() {
                    other.canonical_ref = Some(heir.id);
                }
                self.records.promote(&record, &heir, &duplicates)?;
                debug!(
                    retired = %id,
                    heir = %heir.id,
                    repointed = duplicates.len(),
                    "Promoted duplicate to canonical"
                );
                Ok(DeleteOutcome::Promoted {
                    new_canonical: heir.id,
                    repointed: duplicates.len(),
                })
            }
        }
    }
}
