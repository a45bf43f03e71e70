//! Node addressing and the fixed on-disk layouts of Merkle nodes.
//!
//! A version's upper 48 bits form a 12-nibble path: level `l` keeps the
//! first `l` nibbles, and a node's children are keyed by the next one.

use sha1::{Digest, Sha1};

/// Number of levels below the root; leaves live at this level.
pub const HEIGHT: u32 = 12;
/// Levels actually materialized, counted up from the leaves.
pub const BUILD: u32 = 12;
/// Lock shards covering node read-modify-write.
pub const NLOCK: usize = 137;
pub const HASH_LEN: usize = 16;

pub type Hash = [u8; HASH_LEN];

/// Bytes per encoded [`NodeEntry`].
pub const NODE_ENTRY_LEN: usize = 1 + 4 + 8 + HASH_LEN;

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("storage error: {0}")]
    Storage(#[from] ringkv_storage::StorageError),
    #[error("corrupt merkle node {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// `version` masked down to the granularity of `level`.
pub fn level_version(level: u32, version: u64) -> u64 {
    let shift = (HEIGHT.saturating_sub(level) + 4) * 4;
    version & u64::MAX.checked_shl(shift).unwrap_or(0)
}

/// Store key of the node at `level` covering `version` in tree `tree_id`.
pub fn node_key(level: u32, tree_id: u16, version: u64) -> String {
    format!(
        "{:02X}/{:04X}/{:012X}",
        level,
        tree_id,
        level_version(level, version) >> 16
    )
}

/// Exclusive upper bound of every key of `tree_id` at `level`.
pub fn level_end_key(level: u32, tree_id: u16) -> String {
    format!("{:02X}/{:04X}/~", level, tree_id)
}

/// Parse `LL/TTTT/VVVVVVVVVVVV` back into `(level, tree, version)`.
pub fn parse_node_key(key: &[u8]) -> Option<(u32, u16, u64)> {
    let key = std::str::from_utf8(key).ok()?;
    let mut parts = key.split('/');
    let level = u32::from_str_radix(parts.next()?, 16).ok()?;
    let tree = u16::from_str_radix(parts.next()?, 16).ok()?;
    let number = u64::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((level, tree, number << 16))
}

/// Lock shard guarding the node at `level` covering `version`.
pub fn lock_index(level: u32, tree_id: u16, version: u64) -> usize {
    ((level_version(level, version) | tree_id as u64) % NLOCK as u64) as usize
}

/// Slot a node at `level` occupies inside its parent.
pub fn slot(level: u32, version: u64) -> u8 {
    let shift = HEIGHT.saturating_sub(level) * 4;
    (((version >> 16) >> shift) & 0xF) as u8
}

/// Version of the child in `slot` of the node at `level` covering `version`.
pub fn child_version(level: u32, version: u64, slot: u8) -> u64 {
    let shift = (HEIGHT - level + 3) * 4;
    level_version(level, version) | ((slot as u64) << shift)
}

// ---------------------------------------------------------------------------
// Upper nodes
// ---------------------------------------------------------------------------

/// One occupied child slot of an upper node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub slot: u8,
    pub children: u32,
    pub keycount: u64,
    pub hash: Hash,
}

pub fn encode_node(entries: &[NodeEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * NODE_ENTRY_LEN);
    for e in entries {
        buf.push(e.slot);
        buf.extend_from_slice(&e.children.to_be_bytes());
        buf.extend_from_slice(&e.keycount.to_be_bytes());
        buf.extend_from_slice(&e.hash);
    }
    buf
}

pub fn decode_node(key: &str, bytes: &[u8]) -> Result<Vec<NodeEntry>, MerkleError> {
    if bytes.len() % NODE_ENTRY_LEN != 0 {
        return Err(MerkleError::Corrupt {
            key: key.to_string(),
            reason: format!("length {} is not a multiple of {}", bytes.len(), NODE_ENTRY_LEN),
        });
    }
    Ok(bytes
        .chunks_exact(NODE_ENTRY_LEN)
        .map(|c| {
            let mut children = [0u8; 4];
            children.copy_from_slice(&c[1..5]);
            let mut keycount = [0u8; 8];
            keycount.copy_from_slice(&c[5..13]);
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(&c[13..13 + HASH_LEN]);
            NodeEntry {
                slot: c[0],
                children: u32::from_be_bytes(children),
                keycount: u64::from_be_bytes(keycount),
                hash,
            }
        })
        .collect())
}

/// XOR of the entries' hashes.
pub fn xor_hash<'a>(hashes: impl IntoIterator<Item = &'a Hash>) -> Hash {
    let mut out = [0u8; HASH_LEN];
    for h in hashes {
        for (o, b) in out.iter_mut().zip(h.iter()) {
            *o ^= b;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Leaves
// ---------------------------------------------------------------------------

/// One key stored in a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeafEntry {
    pub key: String,
    pub version: u64,
    pub shard: u32,
}

impl LeafEntry {
    pub fn new(key: impl Into<String>, version: u64, shard: u32) -> Self {
        Self {
            key: key.into(),
            version,
            shard,
        }
    }
}

/// Leaf ordering: version, then key.
pub fn sort_leaf(entries: &mut [LeafEntry]) {
    entries.sort_by(|a, b| (a.version, &a.key).cmp(&(b.version, &b.key)));
}

pub fn encode_leaf(entries: &[LeafEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for e in entries {
        buf.extend_from_slice(&e.version.to_be_bytes());
        buf.extend_from_slice(&e.shard.to_be_bytes());
        buf.extend_from_slice(&(e.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(e.key.as_bytes());
    }
    buf
}

pub fn decode_leaf(key: &str, bytes: &[u8]) -> Result<Vec<LeafEntry>, MerkleError> {
    let corrupt = |reason: &str| MerkleError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let mut out = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 16 {
            return Err(corrupt("truncated leaf entry header"));
        }
        let mut version = [0u8; 8];
        version.copy_from_slice(&rest[0..8]);
        let mut shard = [0u8; 4];
        shard.copy_from_slice(&rest[8..12]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[12..16]);
        let len = u32::from_be_bytes(len) as usize;
        let body = &rest[16..];
        if body.len() < len {
            return Err(corrupt("truncated leaf key"));
        }
        let k = std::str::from_utf8(&body[..len]).map_err(|_| corrupt("leaf key is not utf-8"))?;
        out.push(LeafEntry {
            key: k.to_string(),
            version: u64::from_be_bytes(version),
            shard: u32::from_be_bytes(shard),
        });
        rest = &body[len..];
    }
    Ok(out)
}

/// Hash of an encoded leaf; all zeros for an empty one.
pub fn leaf_hash(encoded: &[u8]) -> Hash {
    let mut out = [0u8; HASH_LEN];
    if !encoded.is_empty() {
        let digest = Sha1::digest(encoded);
        out.copy_from_slice(&digest[..HASH_LEN]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_version_masks() {
        let v = 0x0123_4567_89AB_CDEF;
        assert_eq!(level_version(HEIGHT, v), 0x0123_4567_89AB_0000);
        assert_eq!(level_version(HEIGHT - 1, v), 0x0123_4567_89A0_0000);
        assert_eq!(level_version(1, v), 0x0000_0000_0000_0000);
        assert_eq!(level_version(0, v), 0);

        let v = 0xF123_4567_89AB_CDEF;
        assert_eq!(level_version(1, v), 0xF000_0000_0000_0000);
    }

    #[test]
    fn test_node_key_format() {
        assert_eq!(node_key(12, 5, 1000), "0C/0005/000000000000");
        assert_eq!(node_key(12, 5, 0x1_0000), "0C/0005/000000000001");
        assert_eq!(node_key(0, 0xABCD, u64::MAX), "00/ABCD/000000000000");
        assert_eq!(node_key(11, 1, 0x12_3456_0000), "0B/0001/000000123450");
        assert_eq!(
            parse_node_key(b"0B/0001/000000123450"),
            Some((11, 1, 0x12_3450_0000))
        );
        assert_eq!(parse_node_key(b"bogus"), None);
        assert!(node_key(12, 7, u64::MAX).as_str() < level_end_key(12, 7).as_str());
    }

    #[test]
    fn test_slots_walk_the_nibbles() {
        let v = 0xF123_4567_89AB_CDEF;
        assert_eq!(slot(1, v), 0xF);
        assert_eq!(slot(2, v), 0x1);
        assert_eq!(slot(HEIGHT, v), 0xB);
        assert_eq!(slot(HEIGHT - 1, v), 0xA);

        // A child version rebuilt from its parent lands in the same slot.
        for level in 0..HEIGHT {
            let s = slot(level + 1, v);
            let cv = child_version(level, v, s);
            assert_eq!(level_version(level + 1, v), cv, "level {}", level);
        }
    }

    #[test]
    fn test_node_layout() {
        let entries = vec![
            NodeEntry {
                slot: 3,
                children: 2,
                keycount: 7,
                hash: [0xAB; HASH_LEN],
            },
            NodeEntry {
                slot: 9,
                children: 1,
                keycount: 1,
                hash: [1; HASH_LEN],
            },
        ];
        let bytes = encode_node(&entries);
        assert_eq!(bytes.len(), 2 * NODE_ENTRY_LEN);
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 2]);
        assert_eq!(decode_node("k", &bytes).unwrap(), entries);
        assert!(decode_node("k", &bytes[..10]).is_err());
    }

    #[test]
    fn test_leaf_layout_and_hash() {
        let mut entries = vec![LeafEntry::new("b", 5, 1), LeafEntry::new("a", 5, 2)];
        sort_leaf(&mut entries);
        assert_eq!(entries[0].key, "a");
        let bytes = encode_leaf(&entries);
        assert_eq!(decode_leaf("k", &bytes).unwrap(), entries);
        assert!(decode_leaf("k", &bytes[..bytes.len() - 1]).is_err());

        assert_eq!(leaf_hash(&[]), [0u8; HASH_LEN]);
        assert_ne!(leaf_hash(&bytes), [0u8; HASH_LEN]);
    }

    #[test]
    fn test_xor_hash_is_order_independent() {
        let a = [1u8; HASH_LEN];
        let b = [2u8; HASH_LEN];
        assert_eq!(xor_hash([&a, &b]), xor_hash([&b, &a]));
        assert_eq!(xor_hash([&a, &a]), [0u8; HASH_LEN]);
        assert_eq!(xor_hash([&a, &b])[0], 3);
    }
}
