//! Content-addressed blob storage for canonical content.
//!
//! Layout under the data directory:
//! `blobs/<first two hex chars>/<digest hex>` for committed content and
//! `tmp/` for uploads being spooled while they are fingerprinted. A blob is
//! published with a rename, so it is either absent or complete.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{DedupError, Result};
use crate::fingerprint::Digest;

const BLOB_DIR: &str = "blobs";
const SPOOL_DIR: &str = "tmp";

/// Directory-backed store of content bytes keyed by digest.
#[derive(Debug, Clone)]
pub struct BlobStore {
    blobs: PathBuf,
    spool: PathBuf,
}

impl BlobStore {
    /// Open or create a blob store under `root`; stale spool files from a crash are removed.
    pub fn open(root: &Path) -> Result<Self> {
        let blobs = root.join(BLOB_DIR);
        let spool = root.join(SPOOL_DIR);
        fs::create_dir_all(&blobs).map_err(storage_failure)?;
        if spool.exists() {
            fs::remove_dir_all(&spool).map_err(storage_failure)?;
        }
        fs::create_dir_all(&spool).map_err(storage_failure)?;
        Ok(Self { blobs, spool })
    }

    /// Path where the blob for `digest` lives.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.blobs.join(&hex[..2]).join(hex)
    }

    /// New spool file; deleted automatically unless handed to `publish`.
    pub fn spool(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.spool)
            .map_err(storage_failure)
    }

    /// Durably move a fully written spool file into place as the blob for `digest`.
    pub fn publish(&self, digest: &Digest, spooled: NamedTempFile) -> Result<()> {
        spooled.as_file().sync_all().map_err(storage_failure)?;
        let target = self.path_for(digest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(storage_failure)?;
        }
        spooled
            .persist(&target)
            .map_err(|e| storage_failure(e.error))?;
        debug!(digest = %digest, path = %target.display(), "Published blob");
        Ok(())
    }

    /// True if content for `digest` is stored.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.path_for(digest).is_file()
    }

    /// Digests of every published blob, in no particular order.
    ///
    /// Entries whose names are not digests are skipped.
    pub fn digests(&self) -> Result<Vec<Digest>> {
        let mut found = Vec::new();
        for shard in fs::read_dir(&self.blobs).map_err(storage_failure)? {
            let shard = shard.map_err(storage_failure)?;
            if !shard.file_type().map_err(storage_failure)?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path()).map_err(storage_failure)? {
                let entry = entry.map_err(storage_failure)?;
                let name = entry.file_name();
                if let Some(digest) = name.to_str().and_then(|n| Digest::from_hex(n).ok()) {
                    found.push(digest);
                }
            }
        }
        Ok(found)
    }

    /// Open the stored content for reading.
    pub fn open_blob(&self, digest: &Digest) -> Result<File> {
        File::open(self.path_for(digest)).map_err(|e| {
            DedupError::StorageFailure(format!("blob {} unavailable: {}", digest, e))
        })
    }

    /// Delete the blob for `digest`; absent blobs are not an error.
    pub fn remove(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.path_for(digest)) {
            Ok(()) => {
                debug!(digest = %digest, "Removed blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_failure(e)),
        }
    }
}

fn storage_failure(e: io::Error) -> DedupError {
    DedupError::StorageFailure(e.to_string())
}
