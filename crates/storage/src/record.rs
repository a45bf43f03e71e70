//! On-disk record format for the data namespace.
//!
//! Fixed big-endian header followed by the payload:
//!
//! | offset | size | field   |
//! |--------|------|---------|
//! | 0      | 8    | version |
//! | 8      | 8    | expire  |
//! | 16     | 4    | shard   |
//! | 20     | 4    | kind    |
//! | 24     | ..   | payload |

/// Size of the fixed header.
pub const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Tombstone,
    Data,
}

impl RecordKind {
    fn code(self) -> u32 {
        match self {
            Self::Tombstone => 0,
            Self::Data => 1,
        }
    }
}

/// The stored value for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub version: u64,
    /// Absolute expiry in microseconds, 0 = never.
    pub expire: u64,
    pub shard: u32,
    pub kind: RecordKind,
    pub payload: Vec<u8>,
}

impl Record {
    /// A data record. The payload may be empty.
    pub fn new(version: u64, expire: u64, shard: u32, payload: Vec<u8>) -> Self {
        Self {
            version,
            expire,
            shard,
            kind: RecordKind::Data,
            payload,
        }
    }

    pub fn tombstone(version: u64, expire: u64, shard: u32) -> Self {
        Self {
            version,
            expire,
            shard,
            kind: RecordKind::Tombstone,
            payload: Vec::new(),
        }
    }

    /// `None` is a delete.
    pub fn from_value(version: u64, expire: u64, shard: u32, value: Option<Vec<u8>>) -> Self {
        match value {
            Some(payload) => Self::new(version, expire, shard, payload),
            None => Self::tombstone(version, expire, shard),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == RecordKind::Tombstone
    }

    /// True when the record carries an expiry at or before `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expire != 0 && self.expire <= now
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.expire.to_be_bytes());
        buf.extend_from_slice(&self.shard.to_be_bytes());
        buf.extend_from_slice(&self.kind.code().to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < HEADER_LEN {
            return Err(RecordError::TooShort(bytes.len()));
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(b)
        };
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[at..at + 4]);
            u32::from_be_bytes(b)
        };
        let kind = match u32_at(20) {
            0 => RecordKind::Tombstone,
            1 => RecordKind::Data,
            other => return Err(RecordError::UnknownKind(other)),
        };
        Ok(Self {
            version: u64_at(0),
            expire: u64_at(8),
            shard: u32_at(16),
            kind,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}
