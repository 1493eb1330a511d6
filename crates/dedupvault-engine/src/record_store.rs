//! Typed record storage on top of a `KvStore`.
//!
//! Key layout:
//!
//! | key                          | value                      |
//! |------------------------------|----------------------------|
//! | `rec/<id>`                   | bincode `FileRecord`       |
//! | `canon/<digest hex>`         | id of the canonical record |
//! | `ref/<canonical id>/<dup id>`| empty                      |
//! | `meta/hash_algorithm`        | algorithm name             |
//!
//! A record and the index keys describing it are always written in one batch.

use std::sync::Arc;

use crate::error::{DedupError, Result};
use crate::fingerprint::{Digest, HashAlgorithm};
use crate::kvstore::{BatchOp, KvStore, StoreError};
use crate::record::{FileRecord, RecordId};

const RECORD_PREFIX: &str = "rec/";
const CANONICAL_PREFIX: &str = "canon/";
const REF_PREFIX: &str = "ref/";
const HASH_ALGORITHM_KEY: &str = "meta/hash_algorithm";

fn record_key(id: &RecordId) -> Vec<u8> {
    format!("{}{}", RECORD_PREFIX, id).into_bytes()
}

fn canonical_key(digest: &Digest) -> Vec<u8> {
    format!("{}{}", CANONICAL_PREFIX, digest.to_hex()).into_bytes()
}

fn ref_prefix(canonical: &RecordId) -> Vec<u8> {
    format!("{}{}/", REF_PREFIX, canonical).into_bytes()
}

fn ref_key(canonical: &RecordId, duplicate: &RecordId) -> Vec<u8> {
    format!("{}{}/{}", REF_PREFIX, canonical, duplicate).into_bytes()
}

fn parse_id(bytes: &[u8]) -> Result<RecordId> {
    std::str::from_utf8(bytes)
        .map_err(|e| StoreError::Corrupt(format!("record id is not utf-8: {}", e)))?
        .parse::<RecordId>()
        .map_err(|e| StoreError::Corrupt(e.to_string()).into())
}

fn parse_canonical_entry(key: &[u8], value: &[u8]) -> Result<(Digest, RecordId)> {
    let hex = std::str::from_utf8(&key[CANONICAL_PREFIX.len()..])
        .map_err(|e| StoreError::Corrupt(format!("index key is not utf-8: {}", e)))?;
    let digest =
        Digest::from_hex(hex).map_err(|e| StoreError::Corrupt(format!("bad index key: {}", e)))?;
    Ok((digest, parse_id(value)?))
}

fn parse_ref_key(key: &[u8]) -> Result<(RecordId, RecordId)> {
    let rest = &key[REF_PREFIX.len()..];
    let split = rest
        .iter()
        .position(|b| *b == b'/')
        .ok_or_else(|| StoreError::Corrupt("reverse reference without '/'".to_string()))?;
    Ok((parse_id(&rest[..split])?, parse_id(&rest[split + 1..])?))
}

fn encode(record: &FileRecord) -> Result<Vec<u8>> {
    Ok(bincode::serialize(record).map_err(StoreError::from)?)
}

fn decode(bytes: &[u8]) -> Result<FileRecord> {
    bincode::deserialize(bytes)
        .map_err(|e| StoreError::Corrupt(format!("undecodable record: {}", e)).into())
}

/// Every record and index key as of a single read.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    /// All records.
    pub records: Vec<FileRecord>,
    /// `canon/` entries as (digest, canonical id).
    pub canonical: Vec<(Digest, RecordId)>,
    /// `ref/` keys as (canonical id, duplicate id).
    pub reverse_refs: Vec<(RecordId, RecordId)>,
}

/// Durable keyed storage for `FileRecord`s and their secondary index keys.
#[derive(Clone)]
pub struct RecordStore {
    kv: Arc<dyn KvStore>,
}

impl RecordStore {
    /// Wrap a KV backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Underlying KV backend.
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Fetch a record by id.
    pub fn get(&self, id: &RecordId) -> Result<Option<FileRecord>> {
        match self.kv.get(&record_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every record, read from a single consistent scan.
    pub fn all(&self) -> Result<Vec<FileRecord>> {
        self.kv
            .scan_prefix(RECORD_PREFIX.as_bytes())?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Id of the canonical record for `digest`, if one exists.
    pub fn canonical_id(&self, digest: &Digest) -> Result<Option<RecordId>> {
        match self.kv.get(&canonical_key(digest))? {
            Some(bytes) => Ok(Some(parse_id(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of the duplicates referencing `canonical`.
    pub fn duplicate_ids(&self, canonical: &RecordId) -> Result<Vec<RecordId>> {
        let prefix = ref_prefix(canonical);
        self.kv
            .scan_prefix(&prefix)?
            .iter()
            .map(|(k, _)| parse_id(&k[prefix.len()..]))
            .collect()
    }

    /// Commit a new canonical record together with its content index key.
    pub fn insert_canonical(&self, record: &FileRecord) -> Result<()> {
        if record.is_duplicate {
            return Err(DedupError::InvalidInput(format!(
                "record {} is a duplicate, not canonical",
                record.id
            )));
        }
        self.kv.write_batch(vec![
            BatchOp::Put {
                key: record_key(&record.id),
                value: encode(record)?,
            },
            BatchOp::Put {
                key: canonical_key(&record.digest),
                value: record.id.to_string().into_bytes(),
            },
        ])?;
        Ok(())
    }

    /// Commit a new duplicate record together with its reverse reference key.
    pub fn insert_duplicate(&self, record: &FileRecord) -> Result<()> {
        let canonical = record.canonical_ref.ok_or_else(|| {
            DedupError::InvalidInput(format!("record {} has no canonical reference", record.id))
        })?;
        self.kv.write_batch(vec![
            BatchOp::Put {
                key: record_key(&record.id),
                value: encode(record)?,
            },
            BatchOp::Put {
                key: ref_key(&canonical, &record.id),
                value: Vec::new(),
            },
        ])?;
        Ok(())
    }

    /// Remove a record and the index key describing it.
    pub fn remove(&self, record: &FileRecord) -> Result<()> {
        let index_key = match record.canonical_ref {
            Some(canonical) => ref_key(&canonical, &record.id),
            None => canonical_key(&record.digest),
        };
        self.kv.write_batch(vec![
            BatchOp::Delete {
                key: record_key(&record.id),
            },
            BatchOp::Delete { key: index_key },
        ])?;
        Ok(())
    }

    /// Replace canonical `retired` by `heir` in one batch.
    ///
    /// `heir` must already be marked canonical; every record in `others` must
    /// already reference `heir`.
    pub fn promote(
        &self,
        retired: &FileRecord,
        heir: &FileRecord,
        others: &[FileRecord],
    ) -> Result<()> {
        let mut ops = vec![
            BatchOp::Delete {
                key: record_key(&retired.id),
            },
            BatchOp::Delete {
                key: ref_key(&retired.id, &heir.id),
            },
            BatchOp::Put {
                key: record_key(&heir.id),
                value: encode(heir)?,
            },
            BatchOp::Put {
                key: canonical_key(&heir.digest),
                value: heir.id.to_string().into_bytes(),
            },
        ];
        for other in others {
            ops.push(BatchOp::Delete {
                key: ref_key(&retired.id, &other.id),
            });
            ops.push(BatchOp::Put {
                key: record_key(&other.id),
                value: encode(other)?,
            });
            ops.push(BatchOp::Put {
                key: ref_key(&heir.id, &other.id),
                value: Vec::new(),
            });
        }
        self.kv.write_batch(ops)?;
        Ok(())
    }

    /// Every `canon/` entry as (digest, canonical id).
    pub fn canonical_entries(&self) -> Result<Vec<(Digest, RecordId)>> {
        self.kv
            .scan_prefix(CANONICAL_PREFIX.as_bytes())?
            .iter()
            .map(|(k, v)| parse_canonical_entry(k, v))
            .collect()
    }

    /// Every reverse reference as (canonical id, duplicate id).
    pub fn reverse_refs(&self) -> Result<Vec<(RecordId, RecordId)>> {
        self.kv
            .scan_prefix(REF_PREFIX.as_bytes())?
            .iter()
            .map(|(k, _)| parse_ref_key(k))
            .collect()
    }

    /// Records, canonical entries and reverse references from one consistent scan.
    ///
    /// The three views describe the same committed state, so cross-checks between them
    /// do not see half of a concurrent batch.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let mut snapshot = StoreSnapshot::default();
        for (k, v) in self.kv.scan_prefix(b"")? {
            if k.starts_with(RECORD_PREFIX.as_bytes()) {
                snapshot.records.push(decode(&v)?);
            } else if k.starts_with(CANONICAL_PREFIX.as_bytes()) {
                snapshot.canonical.push(parse_canonical_entry(&k, &v)?);
            } else if k.starts_with(REF_PREFIX.as_bytes()) {
                snapshot.reverse_refs.push(parse_ref_key(&k)?);
            }
        }
        Ok(snapshot)
    }

    /// Hash algorithm the store was created with.
    pub fn hash_algorithm(&self) -> Result<Option<HashAlgorithm>> {
        let Some(bytes) = self.kv.get(HASH_ALGORITHM_KEY.as_bytes())? else {
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&bytes);
        HashAlgorithm::parse(&name)
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown hash algorithm '{}'", name)).into())
    }

    /// Record the hash algorithm for a new store.
    pub fn set_hash_algorithm(&self, algorithm: HashAlgorithm) -> Result<()> {
        self.kv.put(
            HASH_ALGORITHM_KEY.as_bytes().to_vec(),
            algorithm.as_str().as_bytes().to_vec(),
        )?;
        Ok(())
    }
}
