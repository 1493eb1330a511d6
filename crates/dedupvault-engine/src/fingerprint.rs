//! Content fingerprinting: SHA-256 / BLAKE3 digests over byte streams.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;

use crate::error::{DedupError, Result};

/// Default read size when streaming content through the hasher.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Hash function used to fingerprint content. Fixed for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256.
    #[default]
    Sha256,
    /// BLAKE3 (256-bit output).
    Blake3,
}

impl HashAlgorithm {
    /// Stable name persisted alongside the records.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Blake3 => "blake3",
        }
    }

    /// Parse a persisted algorithm name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "blake3" => Some(HashAlgorithm::Blake3),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A 32-byte content digest. Equal digests are treated as equal content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Length of the hex representation.
    pub const HEX_LEN: usize = 64;

    /// Return the digest as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64 character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != Self::HEX_LEN {
            return Err(DedupError::InvalidInput(format!(
                "digest must be {} hex characters, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(DedupError::InvalidInput(format!(
                "digest is not lowercase hex: {}",
                s
            )));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| DedupError::InvalidInput(format!("malformed digest: {}", e)))?;
        Ok(Digest(out))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl FromStr for Digest {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::from_hex(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Digest::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Digest)
        }
    }
}

enum ContentHasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => ContentHasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Blake3 => ContentHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(self) -> Digest {
        match self {
            ContentHasher::Sha256(h) => Digest(h.finalize().into()),
            ContentHasher::Blake3(h) => Digest(*h.finalize().as_bytes()),
        }
    }
}

/// Computes content digests. Pure: never mutates anything but the stream it reads.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    algorithm: HashAlgorithm,
    chunk_size: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(HashAlgorithm::default(), DEFAULT_CHUNK_SIZE)
    }
}

impl Fingerprinter {
    /// Create a fingerprinter. A zero chunk size falls back to the default.
    pub fn new(algorithm: HashAlgorithm, chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            algorithm,
            chunk_size,
        }
    }

    /// Hash function in use.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Digest of an in-memory buffer.
    pub fn fingerprint_bytes(&self, data: &[u8]) -> Digest {
        let mut hasher = ContentHasher::new(self.algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    /// Stream `reader` to EOF in `chunk_size` reads. Returns the digest and byte count.
    pub fn fingerprint_reader<R: Read>(&self, reader: R) -> Result<(Digest, u64)> {
        self.fingerprint_into(reader, io::sink())
    }

    /// Hash from the current position to EOF, then seek back to where the stream was.
    ///
    /// The position is restored even when a read fails partway through.
    pub fn fingerprint_seekable<R: Read + Seek>(&self, source: &mut R) -> Result<(Digest, u64)> {
        let start = source.stream_position()?;
        let hashed = self.fingerprint_reader(&mut *source);
        source.seek(SeekFrom::Start(start))?;
        hashed
    }

    /// Hash `reader` while copying every byte into `sink` in the same pass.
    ///
    /// This is how non-seekable sources are buffered for later persistence.
    /// Read failures surface as `Io`, sink failures as `StorageFailure`.
    pub fn fingerprint_into<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut sink: W,
    ) -> Result<(Digest, u64)> {
        let mut hasher = ContentHasher::new(self.algorithm);
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DedupError::Io(e)),
            };
            hasher.update(&buf[..n]);
            sink.write_all(&buf[..n]).map_err(sink_failure)?;
            total += n as u64;
        }
        sink.flush().map_err(sink_failure)?;
        Ok((hasher.finalize(), total))
    }
}

fn sink_failure(e: io::Error) -> DedupError {
    DedupError::StorageFailure(format!("writing content copy failed: {}", e))
}

/// SHA-256 digest of `data` with default settings.
pub fn sha256_digest(data: &[u8]) -> Digest {
    Fingerprinter::new(HashAlgorithm::Sha256, DEFAULT_CHUNK_SIZE).fingerprint_bytes(data)
}
