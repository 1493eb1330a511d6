//! Persistent file-backed KV store with WAL and checkpoint support.
//!
//! Uses an in-memory BTreeMap as read cache, a write-ahead log (WAL) for durability,
//! and periodic checkpoint files for fast recovery. Every `write_batch` is one WAL
//! frame, so a batch is recovered whole or not at all.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::kvstore::{apply_ops, scan, BatchOp, KvPair, KvStore, StoreError, Value};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";

#[derive(Debug, Serialize, Deserialize, Clone)]
enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl From<BatchOp> for WalOp {
    fn from(op: BatchOp) -> Self {
        match op {
            BatchOp::Put { key, value } => WalOp::Put { key, value },
            BatchOp::Delete { key } => WalOp::Delete { key },
        }
    }
}

impl From<WalOp> for BatchOp {
    fn from(op: WalOp) -> Self {
        match op {
            WalOp::Put { key, value } => BatchOp::Put { key, value },
            WalOp::Delete { key } => BatchOp::Delete { key },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    ops: Vec<WalOp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct WalWriter {
    file: File,
    len: u64,
    seq: u64,
    since_checkpoint: u64,
}

impl WalWriter {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(WalWriter {
            file,
            len,
            seq: 0,
            since_checkpoint: 0,
        })
    }

    fn append(&mut self, entry: &WalEntry) -> Result<(), StoreError> {
        let encoded = bincode::serialize(entry)?;
        let mut frame = Vec::with_capacity(4 + encoded.len());
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        if let Err(e) = self.file.write_all(&frame).and_then(|_| self.file.sync_all()) {
            // Cut off any partial frame so later appends stay replayable.
            if let Err(trunc) = self.file.set_len(self.len) {
                warn!(error = %trunc, "Failed to roll back partial WAL frame");
            }
            return Err(e.into());
        }
        self.len += frame.len() as u64;
        self.since_checkpoint += 1;
        Ok(())
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.len = 0;
        self.since_checkpoint = 0;
        Ok(())
    }
}

/// Persistent file-backed KV store.
///
/// Provides durability through a write-ahead log (WAL) and periodic checkpoints.
/// On open, loads the last checkpoint and replays any remaining WAL entries.
/// A torn frame at the end of the WAL (crash mid-append) is discarded.
pub struct PersistentKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    wal: Mutex<WalWriter>,
    dir: PathBuf,
    checkpoint_interval: u64,
}

impl PersistentKvStore {
    /// Opens or creates a persistent KV store in the given directory.
    ///
    /// `checkpoint_interval` is the number of WAL appends after which a checkpoint
    /// is taken automatically; 0 disables automatic checkpoints.
    pub fn open(dir: &Path, checkpoint_interval: u64) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;

        let wal_path = dir.join(WAL_FILENAME);
        let mut data = BTreeMap::new();
        let mut seq = load_checkpoint(&dir.join(CHECKPOINT_FILENAME), &mut data)?;
        let (replayed, max_seq) = replay_wal(&wal_path, &mut data, seq)?;
        seq = max_seq;

        let mut wal = WalWriter::open(&wal_path)?;
        wal.seq = seq;
        wal.since_checkpoint = replayed;

        info!(
            dir = %dir.display(),
            keys = data.len(),
            replayed,
            seq,
            "Opened persistent store"
        );

        Ok(Self {
            data: RwLock::new(data),
            wal: Mutex::new(wal),
            dir: dir.to_path_buf(),
            checkpoint_interval,
        })
    }

    /// Directory holding the WAL and checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Last sequence number written.
    pub fn seq(&self) -> u64 {
        self.wal.lock().seq
    }

    fn checkpoint_locked(&self, wal: &mut WalWriter) -> Result<(), StoreError> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let checkpoint = Checkpoint {
            seq: wal.seq,
            entries,
        };
        let encoded = bincode::serialize(&checkpoint)?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let mut tmp_path = checkpoint_path.clone();
        tmp_path.set_extension("tmp");

        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }

        fs::rename(&tmp_path, &checkpoint_path)?;
        wal.truncate()?;

        debug!(seq = checkpoint.seq, keys = checkpoint.entries.len(), "Checkpoint written");
        Ok(())
    }
}

fn load_checkpoint(path: &Path, data: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<u64, StoreError> {
    if !path.exists() {
        return Ok(0);
    }

    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok(0);
    }

    let checkpoint: Checkpoint = bincode::deserialize(&contents)
        .map_err(|e| StoreError::Corrupt(format!("failed to deserialize checkpoint: {}", e)))?;
    data.extend(checkpoint.entries);
    Ok(checkpoint.seq)
}

/// Replays WAL frames newer than `seq`. Returns (frames applied, highest seq seen).
fn replay_wal(
    path: &Path,
    data: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    seq: u64,
) -> Result<(u64, u64), StoreError> {
    if !path.exists() {
        return Ok((0, seq));
    }

    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;

    let mut offset = 0usize;
    let mut applied = 0u64;
    let mut max_seq = seq;

    while offset < contents.len() {
        let Some(len_bytes) = contents.get(offset..offset + 4) else {
            break;
        };
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        let Some(frame) = contents.get(offset + 4..offset + 4 + len) else {
            break;
        };
        let entry: WalEntry = match bincode::deserialize(frame) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(offset, error = %e, "Undecodable WAL frame, stopping replay");
                break;
            }
        };
        offset += 4 + len;

        // Frames already folded into the checkpoint are skipped.
        if entry.seq <= seq {
            continue;
        }
        max_seq = max_seq.max(entry.seq);
        apply_ops(data, entry.ops.into_iter().map(BatchOp::from).collect());
        applied += 1;
    }

    if offset < contents.len() {
        warn!(
            path = %path.display(),
            discarded = contents.len() - offset,
            "Discarding torn WAL tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
    }

    Ok((applied, max_seq))
}

impl KvStore for PersistentKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        Ok(scan(&self.data.read(), prefix))
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.data.read().contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        // The WAL lock is held across append and apply so log order matches apply order.
        let mut wal = self.wal.lock();
        let entry = WalEntry {
            seq: wal.seq + 1,
            ops: ops.iter().cloned().map(WalOp::from).collect(),
        };
        wal.append(&entry)?;
        wal.seq = entry.seq;
        apply_ops(&mut self.data.write(), ops);

        if self.checkpoint_interval > 0 && wal.since_checkpoint >= self.checkpoint_interval {
            if let Err(e) = self.checkpoint_locked(&mut wal) {
                // The batch is already durable in the WAL.
                warn!(error = %e, "Automatic checkpoint failed");
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), StoreError> {
        let mut wal = self.wal.lock();
        self.checkpoint_locked(&mut wal)
    }
}
