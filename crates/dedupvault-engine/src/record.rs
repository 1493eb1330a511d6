//! File records: the data model shared by the index, resolver and ledger.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DedupError;
use crate::fingerprint::Digest;

/// Media type recorded when the caller does not supply one.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Globally unique identifier of a file record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Allocates a fresh random id.
    pub fn new() -> Self {
        RecordId(Uuid::new_v4())
    }

    /// The all-zero id.
    pub fn nil() -> Self {
        RecordId(Uuid::nil())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        RecordId(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RecordId {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(RecordId)
            .map_err(|e| DedupError::InvalidInput(format!("invalid record id '{}': {}", s, e)))
    }
}

/// Wall-clock time with nanosecond resolution.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch.
    pub secs: u64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current wall-clock time; clamps to the epoch if the clock is set before it.
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// The timestamp one nanosecond later.
    pub fn next_nanosecond(&self) -> Self {
        if self.nanos >= 999_999_999 {
            Self {
                secs: self.secs + 1,
                nanos: 0,
            }
        } else {
            Self {
                secs: self.secs,
                nanos: self.nanos + 1,
            }
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Issues creation timestamps that never go backwards, even if the wall clock does.
///
/// Consecutive timestamps are distinct, so creation order is total.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Timestamp>,
}

impl MonotonicClock {
    /// Creates a clock that will not issue anything earlier than `floor`.
    pub fn starting_at(floor: Timestamp) -> Self {
        Self {
            last: Mutex::new(floor),
        }
    }

    /// Returns the wall clock, or one nanosecond past the last issued time if that is later.
    pub fn now(&self) -> Timestamp {
        let mut last = self.last.lock();
        let wall = Timestamp::now();
        let now = if wall > *last {
            wall
        } else {
            last.next_nanosecond()
        };
        *last = now;
        now
    }
}

/// One ingested upload.
///
/// A record is canonical (`is_duplicate == false`) for its digest, or a duplicate
/// that names the canonical record through `canonical_ref` (never another duplicate).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Unique id, assigned at creation.
    pub id: RecordId,
    /// Caller-supplied original name.
    pub display_name: String,
    /// Caller-supplied content classification.
    pub media_type: String,
    /// Exact byte length of the content.
    pub size_bytes: u64,
    /// Content digest.
    pub digest: Digest,
    /// Creation time, non-decreasing across the engine.
    pub created_at: Timestamp,
    /// True iff a canonical record with the same digest existed at creation.
    pub is_duplicate: bool,
    /// Id of the canonical record; set iff `is_duplicate`.
    pub canonical_ref: Option<RecordId>,
}

impl FileRecord {
    /// A record that becomes the canonical holder of `digest`.
    pub fn canonical(
        display_name: String,
        media_type: String,
        size_bytes: u64,
        digest: Digest,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: RecordId::new(),
            display_name,
            media_type,
            size_bytes,
            digest,
            created_at,
            is_duplicate: false,
            canonical_ref: None,
        }
    }

    /// A record referencing `canonical`, which must itself be canonical.
    pub fn duplicate_of(
        canonical: &FileRecord,
        display_name: String,
        media_type: String,
        size_bytes: u64,
        created_at: Timestamp,
    ) -> Self {
        debug_assert!(!canonical.is_duplicate, "duplicate chains are not allowed");
        Self {
            id: RecordId::new(),
            display_name,
            media_type,
            size_bytes,
            digest: canonical.digest,
            created_at,
            is_duplicate: true,
            canonical_ref: Some(canonical.id),
        }
    }

    /// True if this record holds the content for its digest.
    pub fn is_canonical(&self) -> bool {
        !self.is_duplicate
    }

    /// The id whose content this record resolves to.
    pub fn content_owner(&self) -> RecordId {
        self.canonical_ref.unwrap_or(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::sha256_digest;

    #[test]
    fn test_duplicate_points_at_canonical() {
        let digest = sha256_digest(b"hello");
        let original = FileRecord::canonical(
            "a.txt".into(),
            "text/plain".into(),
            5,
            digest,
            Timestamp::now(),
        );
        let dup = FileRecord::duplicate_of(
            &original,
            "b.txt".into(),
            "text/plain".into(),
            5,
            Timestamp::now(),
        );
        assert!(original.is_canonical());
        assert!(dup.is_duplicate);
        assert_eq!(dup.canonical_ref, Some(original.id));
        assert_eq!(dup.digest, original.digest);
        assert_eq!(dup.content_owner(), original.id);
        assert_eq!(original.content_owner(), original.id);
        assert_ne!(dup.id, original.id);
    }

    #[test]
    fn test_record_id_parse() {
        let id = RecordId::new();
        assert_eq!(id.to_string().parse::<RecordId>().unwrap(), id);
        assert!(matches!(
            "not-a-uuid".parse::<RecordId>(),
            Err(DedupError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp { secs: 10, nanos: 5 };
        let b = Timestamp { secs: 10, nanos: 6 };
        let c = Timestamp { secs: 11, nanos: 0 };
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "10.000000005");
    }

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let future = Timestamp {
            secs: u64::MAX / 2,
            nanos: 0,
        };
        let clock = MonotonicClock::starting_at(future);
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t1 > future);
        assert!(t2 > t1);

        let clock = MonotonicClock::default();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_next_nanosecond_carries() {
        let t = Timestamp {
            secs: 1,
            nanos: 999_999_999,
        };
        assert_eq!(t.next_nanosecond(), Timestamp { secs: 2, nanos: 0 });
    }

    #[test]
    fn test_bincode_round_trip() {
        let record = FileRecord::canonical(
            "photo.jpg".into(),
            "image/jpeg".into(),
            1234,
            sha256_digest(b"jpeg bytes"),
            Timestamp::now(),
        );
        let encoded = bincode::serialize(&record).unwrap();
        let decoded: FileRecord = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
