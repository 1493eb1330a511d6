//! `DedupEngine`: the facade tying fingerprinting, resolution, blobs and the ledger together.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::config::EngineConfig;
use crate::content_index::ContentIndex;
use crate::error::{DedupError, Result};
use crate::fingerprint::{Digest, Fingerprinter};
use crate::integrity::{self, IntegrityReport};
use crate::kvstore::{KvStore, MemoryKvStore};
use crate::ledger::{self, LedgerSnapshot, StorageLedger};
use crate::persistent::PersistentKvStore;
use crate::record::{FileRecord, MonotonicClock, RecordId};
use crate::record_store::RecordStore;
use crate::resolver::{ContentHooks, DedupResolver, DeleteOutcome, ResolveRequest};

const RECORDS_DIR: &str = "records";

/// Caller-supplied attributes of an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestMeta {
    /// Original file name; must not be blank.
    pub display_name: String,
    /// Content classification; blank means `application/octet-stream`.
    pub media_type: String,
    /// Size the caller claims; the upload is rejected if the stream disagrees.
    pub expected_size: Option<u64>,
}

impl IngestMeta {
    /// Metadata without a size claim.
    pub fn new(display_name: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            media_type: media_type.into(),
            expected_size: None,
        }
    }

    /// Require the stream to be exactly `size` bytes.
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

/// Publishes spooled content for new digests and removes blobs nobody references.
struct BlobHooks<'a> {
    blobs: Option<&'a BlobStore>,
    spool: Option<NamedTempFile>,
}

impl BlobHooks<'_> {
    fn discard(&self, digest: &Digest, reason: &str) {
        if let Some(blobs) = self.blobs {
            if let Err(e) = blobs.remove(digest) {
                warn!(digest = %digest, error = %e, reason, "Failed to remove blob");
            }
        }
    }
}

impl ContentHooks for BlobHooks<'_> {
    fn persist_new(&mut self, digest: &Digest) -> Result<()> {
        match (self.blobs, self.spool.take()) {
            (Some(blobs), Some(spool)) => blobs.publish(digest, spool),
            _ => Ok(()),
        }
    }

    fn rollback_new(&mut self, digest: &Digest) {
        self.discard(digest, "record commit failed");
    }

    fn release_last(&mut self, digest: &Digest) {
        self.discard(digest, "last reference deleted");
    }
}

/// Content-addressable deduplication engine.
///
/// Synchronous and `Send + Sync`: share it behind an `Arc` and call it from
/// as many threads (or `spawn_blocking` tasks) as there are uploads.
pub struct DedupEngine {
    config: EngineConfig,
    records: RecordStore,
    index: ContentIndex,
    resolver: DedupResolver,
    ledger: StorageLedger,
    fingerprinter: Fingerprinter,
    blobs: Option<BlobStore>,
}

impl DedupEngine {
    /// Open or create a durable engine under `config.data_dir`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            DedupError::StorageFailure(format!(
                "cannot create data dir {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;
        let kv = PersistentKvStore::open(
            &config.data_dir.join(RECORDS_DIR),
            config.checkpoint_interval,
        )?;
        let blobs = if config.store_content {
            Some(BlobStore::open(&config.data_dir)?)
        } else {
            None
        };
        Self::assemble(Arc::new(kv), blobs, config)
    }

    /// Accounting-only engine over an in-memory store; no content bytes are kept.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::with_store(Arc::new(MemoryKvStore::new()), config)
    }

    /// Accounting-only engine over any KV backend.
    pub fn with_store(kv: Arc<dyn KvStore>, config: EngineConfig) -> Result<Self> {
        Self::assemble(kv, None, config)
    }

    /// Engine over any KV backend that keeps content in `blobs`.
    pub fn with_parts(
        kv: Arc<dyn KvStore>,
        blobs: BlobStore,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::assemble(kv, Some(blobs), config)
    }

    fn assemble(
        kv: Arc<dyn KvStore>,
        blobs: Option<BlobStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        if config.read_chunk_size == 0 {
            return Err(DedupError::Config("read_chunk_size must be > 0".to_string()));
        }
        let records = RecordStore::new(kv);

        match records.hash_algorithm()? {
            Some(stored) if stored != config.hash_algorithm => {
                return Err(DedupError::Config(format!(
                    "store was created with {}, configured for {}",
                    stored, config.hash_algorithm
                )));
            }
            Some(_) => {}
            None => records.set_hash_algorithm(config.hash_algorithm)?,
        }

        let existing = records.all()?;
        // Creation times stay ordered across restarts even if the wall clock moved back.
        let clock = match existing.iter().map(|r| r.created_at).max() {
            Some(latest) => MonotonicClock::starting_at(latest),
            None => MonotonicClock::default(),
        };

        let ledger = StorageLedger::new();
        let snapshot = ledger.recompute(&records)?;

        info!(
            records = snapshot.total_files,
            unique = snapshot.unique_files,
            algorithm = %config.hash_algorithm,
            store_content = blobs.is_some(),
            "Dedup engine ready"
        );

        Ok(Self {
            index: ContentIndex::new(records.clone()),
            resolver: DedupResolver::with_clock(records.clone(), clock),
            fingerprinter: Fingerprinter::new(config.hash_algorithm, config.read_chunk_size),
            records,
            ledger,
            blobs,
            config,
        })
    }

    /// Configuration the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fingerprinter matching the store's hash algorithm.
    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    /// Fingerprint `reader` to EOF and record it as canonical or duplicate.
    ///
    /// Nothing is persisted unless the whole upload is read, fits the size
    /// limits and the record commits. Content bytes are kept only for new digests.
    /// The ledger snapshot is recomputed and published before this returns.
    pub fn ingest<R: Read>(&self, reader: R, meta: IngestMeta) -> Result<FileRecord> {
        if meta.display_name.trim().is_empty() {
            return Err(DedupError::InvalidInput(
                "display name must not be empty".to_string(),
            ));
        }

        // One byte past the limit is enough to know the upload is too large.
        let limit = self
            .config
            .max_ingest_bytes
            .map_or(u64::MAX, |max| max.saturating_add(1));
        let mut bounded = reader.take(limit);

        let (digest, size, spool) = match &self.blobs {
            Some(blobs) => {
                let mut spool = blobs.spool()?;
                let (digest, size) = self
                    .fingerprinter
                    .fingerprint_into(&mut bounded, spool.as_file_mut())?;
                (digest, size, Some(spool))
            }
            None => {
                let (digest, size) = self.fingerprinter.fingerprint_reader(&mut bounded)?;
                (digest, size, None)
            }
        };

        if let Some(max) = self.config.max_ingest_bytes {
            if size > max {
                return Err(DedupError::InvalidInput(format!(
                    "upload exceeds the {} byte limit",
                    max
                )));
            }
        }
        if let Some(expected) = meta.expected_size {
            if expected != size {
                return Err(DedupError::InvalidInput(format!(
                    "declared size {} but stream held {} bytes",
                    expected, size
                )));
            }
        }

        let request = ResolveRequest::new(digest, size, meta.display_name, meta.media_type);
        let mut hooks = BlobHooks {
            blobs: self.blobs.as_ref(),
            spool,
        };
        let record = self.resolver.resolve_with(request, &mut hooks)?;
        let snapshot = self.ledger.recompute(&self.records)?;

        info!(
            id = %record.id,
            digest = %record.digest,
            size = record.size_bytes,
            duplicate = record.is_duplicate,
            total_files = snapshot.total_files,
            "Ingested file"
        );
        Ok(record)
    }

    /// Ingest an in-memory buffer.
    pub fn ingest_bytes(
        &self,
        data: &[u8],
        display_name: impl Into<String>,
        media_type: impl Into<String>,
    ) -> Result<FileRecord> {
        let meta = IngestMeta::new(display_name, media_type).with_expected_size(data.len() as u64);
        self.ingest(data, meta)
    }

    /// Ingest a file from disk, named after its final path component.
    pub fn ingest_path(&self, path: &Path, media_type: impl Into<String>) -> Result<FileRecord> {
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DedupError::InvalidInput(format!("{} has no file name", path.display()))
            })?;
        let file = File::open(path)?;
        self.ingest(file, IngestMeta::new(display_name, media_type))
    }

    /// Fetch a record by id.
    pub fn get(&self, id: &RecordId) -> Result<FileRecord> {
        self.records.get(id)?.ok_or(DedupError::NotFound(*id))
    }

    /// Open the content of a record, following a duplicate to its canonical record.
    pub fn open_content(&self, id: &RecordId) -> Result<File> {
        let blobs = self.blobs.as_ref().ok_or_else(|| {
            DedupError::Config("content is not stored by this engine".to_string())
        })?;
        let record = self.get(id)?;
        let owner = match record.canonical_ref {
            Some(canonical) => self.records.get(&canonical)?.ok_or_else(|| {
                DedupError::StorageFailure(format!(
                    "record {} references missing canonical {}",
                    id, canonical
                ))
            })?,
            None => record,
        };
        debug!(id = %id, owner = %owner.id, "Opening content");
        blobs.open_blob(&owner.digest)
    }

    /// Delete a record under the configured delete policy, then republish the ledger.
    pub fn delete(&self, id: &RecordId) -> Result<DeleteOutcome> {
        let mut hooks = BlobHooks {
            blobs: self.blobs.as_ref(),
            spool: None,
        };
        let outcome = self
            .resolver
            .release(id, self.config.delete_policy, &mut hooks)?;
        let snapshot = self.ledger.recompute(&self.records)?;
        info!(
            id = %id,
            outcome = ?outcome,
            total_files = snapshot.total_files,
            "Deleted record"
        );
        Ok(outcome)
    }

    /// Recompute and publish the storage ledger.
    pub fn statistics(&self) -> Result<Arc<LedgerSnapshot>> {
        self.ledger.recompute(&self.records)
    }

    /// Ledger snapshot published by the last ingest, delete or `statistics` call.
    pub fn current_statistics(&self) -> Arc<LedgerSnapshot> {
        self.ledger.current()
    }

    /// Bytes saved thanks to record `id`.
    pub fn storage_saved(&self, id: &RecordId) -> Result<u64> {
        let record = self.get(id)?;
        ledger::storage_saved(&record, &self.index)
    }

    /// Duplicates currently referencing canonical record `id`.
    pub fn duplicates_of(&self, id: &RecordId) -> Result<Vec<FileRecord>> {
        self.index.duplicates_of(id)
    }

    /// Every record, newest first.
    pub fn list(&self) -> Result<Vec<FileRecord>> {
        let mut all = self.records.all()?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all)
    }

    /// Cross-check records, index keys and stored content.
    pub fn verify(&self) -> Result<IntegrityReport> {
        integrity::verify(&self.records, self.blobs.as_ref(), self.resolver.locks())
    }

    /// Compact the write-ahead log where the backend keeps one.
    pub fn checkpoint(&self) -> Result<()> {
        self.records.kv().checkpoint()?;
        info!(data_dir = %self.config.data_dir.display(), "Checkpoint complete");
        Ok(())
    }
}
