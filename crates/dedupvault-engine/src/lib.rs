#![warn(missing_docs)]

//! dedupvault engine: content-addressable deduplication for ingested files.
//!
//! Ingest path: Bytes → Fingerprint (SHA-256/BLAKE3) → Resolve (per-digest critical section)
//!              → Blob (new content only) → Commit record
//! Read path:   Record → canonical record → Blob
//! Statistics:  full record scan → LedgerSnapshot (published by Arc swap)

pub mod blob;
pub mod config;
pub mod content_index;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod integrity;
pub mod kvstore;
pub mod ledger;
pub mod persistent;
pub mod record;
pub mod record_store;
pub mod resolver;

pub use blob::BlobStore;
pub use config::{DeletePolicy, EngineConfig};
pub use content_index::ContentIndex;
pub use engine::{DedupEngine, IngestMeta};
pub use error::{DedupError, ErrorKind, Result};
pub use fingerprint::{Digest, Fingerprinter, HashAlgorithm};
pub use integrity::{IntegrityIssue, IntegrityReport};
pub use kvstore::{BatchOp, KvStore, MemoryKvStore, StoreError};
pub use ledger::{LedgerSnapshot, StorageLedger};
pub use persistent::PersistentKvStore;
pub use record::{FileRecord, MonotonicClock, RecordId, Timestamp};
pub use record_store::{RecordStore, StoreSnapshot};
pub use resolver::{
    ContentHooks, DedupResolver, DeleteOutcome, DigestLocks, NoContent, ResolveRequest,
};
