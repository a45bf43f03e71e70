//! ringkv-common: shared types for the ringkv project.
//!
//! Provides the server descriptor, write/fetch status codes, the datum
//! carried by writes and replication, the microsecond version clock and
//! the key-to-shard hash that places keys on the ring.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Time and versions
// ---------------------------------------------------------------------------

/// Microseconds since the unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Issues strictly increasing, time-derived version numbers.
///
/// Each call returns `max(now_micros(), last + 1)`, so two writes from the
/// same process never share a version even within one microsecond.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version.
    pub fn next(&self) -> u64 {
        let now = now_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shards
// ---------------------------------------------------------------------------

/// 32-bit ring position of a key: the first four bytes of its SHA-1,
/// read big-endian.
pub fn shard_hash(key: &str) -> u32 {
    let digest = Sha1::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Outcome of a write, as seen by the caller and carried in DIST replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PutStatus {
    /// Stored.
    Done,
    /// Rejected: transform failed or the request was malformed.
    Bad,
    /// Rejected: already expired.
    Old,
    /// Rejected: the key's partition is not owned here.
    NotMe,
    /// Already stored at this or a newer version.
    Have,
}

impl PutStatus {
    /// Wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::Done => 0,
            Self::Bad => 1,
            Self::Old => 2,
            Self::NotMe => 3,
            Self::Have => 4,
        }
    }

    /// Parse a wire code. Unknown codes map to `Bad`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Done,
            2 => Self::Old,
            3 => Self::NotMe,
            4 => Self::Have,
            _ => Self::Bad,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Bad => "bad",
            Self::Old => "old",
            Self::NotMe => "notme",
            Self::Have => "have",
        }
    }
}

impl fmt::Display for PutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a candidate version is worth fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantIt {
    /// Absent locally, or the candidate is newer.
    Want,
    /// Stored at exactly the candidate version.
    Have,
    /// Stored at a newer version.
    LocalNewer,
}

// ---------------------------------------------------------------------------
// Data carried by writes
// ---------------------------------------------------------------------------

/// A single write as it travels from client to owner to replicas.
///
/// `version`, `shard` and `value` may be absent on the originating request;
/// the owning node fills them in before the datum is replicated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Datum {
    pub key: String,
    /// `None` means a delete (stored as a tombstone); an empty value is data.
    pub value: Option<Vec<u8>>,
    /// 0 = assign on the owning node.
    pub version: u64,
    pub shard: Option<u32>,
    /// Absolute expiry in microseconds, 0 = none.
    pub expire: u64,
    /// Transform program; stripped before replication.
    pub program: Option<Vec<u8>>,
}

impl Datum {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shard = Some(shard);
        self
    }

    pub fn with_expire(mut self, expire: u64) -> Self {
        self.expire = expire;
        self
    }
}

/// A `(key, version)` pair: one item of a GET request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyVersion {
    pub key: String,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

/// Everything the core knows about one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub datacenter: String,
    pub rack: String,
    /// Transport address, `host:port`.
    pub address: String,
    /// Reachable according to the liveness probe.
    pub up: bool,
    /// Accepting requests.
    pub available: bool,
    /// Finished at least one full anti-entropy pass.
    pub uptodate: bool,
    pub last_config_version: u64,
}

impl ServerInfo {
    pub fn new(
        id: impl Into<String>,
        datacenter: impl Into<String>,
        rack: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            datacenter: datacenter.into(),
            rack: rack.into(),
            address: address.into(),
            up: false,
            available: false,
            uptodate: false,
            last_config_version: 0,
        }
    }

    pub fn is_up(&self) -> bool {
        self.up && self.available
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.id, self.datacenter, self.rack)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_clock_strictly_increasing() {
        let clock = VersionClock::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let v = clock.next();
            assert!(v > prev, "{} should be > {}", v, prev);
            prev = v;
        }
    }

    #[test]
    fn test_version_clock_tracks_wall_time() {
        let before = now_micros();
        let v = VersionClock::new().next();
        assert!(v >= before);
    }

    #[test]
    fn test_shard_hash_deterministic() {
        assert_eq!(shard_hash("hello"), shard_hash("hello"));
        assert_ne!(shard_hash("hello"), shard_hash("world"));
        // sha1("hello") = aaf4c61d...
        assert_eq!(shard_hash("hello"), 0xaaf4_c61d);
    }

    #[test]
    fn test_put_status_codes() {
        for status in [
            PutStatus::Done,
            PutStatus::Bad,
            PutStatus::Old,
            PutStatus::NotMe,
            PutStatus::Have,
        ] {
            assert_eq!(PutStatus::from_code(status.code()), status);
        }
        assert_eq!(PutStatus::from_code(99), PutStatus::Bad);
    }

    #[test]
    fn test_server_is_up_requires_available() {
        let mut s = ServerInfo::new("a", "dc1", "r1", "127.0.0.1:1");
        assert!(!s.is_up());
        s.up = true;
        assert!(!s.is_up());
        s.available = true;
        assert!(s.is_up());
    }

    #[test]
    fn test_datum_serde() {
        let d = Datum::new("k", b"v".to_vec()).with_version(7).with_shard(3);
        let json = serde_json::to_string(&d).unwrap();
        let back: Datum = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
