//! Explicit-TTL bookkeeping.
//!
//! Writes carrying their own expiry are grouped into coarse buckets (about
//! four and a half minutes wide) and persisted under the `x` namespace as
//! NUL-delimited key lists. Default-TTL expiry needs none of this: it walks
//! the Merkle time index directly (see `Database::expire`).

use parking_lot::Mutex;
use ringkv_storage::keystore::ns;
use ringkv_storage::{KeyStore, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Bucket granularity mask, in microseconds.
pub const BUCKET_MASK: u64 = 0x0FFF_FFFF;

/// Round an expiry up to the end of its bucket, so a due bucket only
/// holds keys that have expired.
pub fn bucket_of(expire_at: u64) -> u64 {
    expire_at.saturating_add(BUCKET_MASK) & !BUCKET_MASK
}

pub fn bucket_key(bucket: u64) -> String {
    format!("{:016X}", bucket)
}

fn split_keys(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    bytes
        .split(|b| *b == 0)
        .filter(|k| !k.is_empty())
        .map(|k| String::from_utf8_lossy(k).into_owned())
}

pub struct Expirer {
    store: Arc<dyn KeyStore>,
    pending: Mutex<BTreeMap<u64, Vec<String>>>,
}

impl std::fmt::Debug for Expirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expirer")
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl Expirer {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Queue `key` for deletion once `expire_at` has passed.
    pub fn add(&self, key: &str, expire_at: u64) {
        self.pending
            .lock()
            .entry(bucket_of(expire_at))
            .or_default()
            .push(key.to_string());
    }

    /// Number of keys queued in memory.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Merge queued keys into their persisted buckets. Returns the number
    /// of buckets written.
    pub fn flush(&self) -> Result<usize, StorageError> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut written = 0;
        for (bucket, mut keys) in pending {
            let key = bucket_key(bucket);
            if let Some(existing) = self.store.get(ns::EXPIRE, key.as_bytes())? {
                keys.extend(split_keys(&existing));
            }
            keys.sort_unstable();
            keys.dedup();
            self.store
                .put(ns::EXPIRE, key.as_bytes(), keys.join("\0").as_bytes())?;
            written += 1;
        }
        Ok(written)
    }

    /// Persisted buckets whose time has come, oldest first.
    pub fn due_buckets(&self, now: u64) -> Result<Vec<(u64, Vec<String>)>, StorageError> {
        let end = bucket_key(now.saturating_add(1));
        let mut due = Vec::new();
        self.store
            .range(ns::EXPIRE, b"", end.as_bytes(), &mut |k, v| {
                match std::str::from_utf8(k)
                    .ok()
                    .and_then(|s| u64::from_str_radix(s, 16).ok())
                {
                    Some(bucket) => due.push((bucket, split_keys(v).collect())),
                    None => tracing::warn!(
                        "ignoring malformed expiry bucket key {:?}",
                        String::from_utf8_lossy(k)
                    ),
                }
                true
            })?;
        Ok(due)
    }

    pub fn delete_bucket(&self, bucket: u64) -> Result<(), StorageError> {
        self.store
            .delete(ns::EXPIRE, bucket_key(bucket).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_storage::MemoryStore;

    #[test]
    fn test_bucket_rounds_up() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(1), 0x1000_0000);
        assert_eq!(bucket_of(0x1000_0000), 0x1000_0000);
        assert_eq!(bucket_of(0x1000_0001), 0x2000_0000);
        assert_eq!(bucket_key(0x1000_0000), "0000000010000000");
    }

    #[test]
    fn test_flush_merges_and_dedupes() {
        let store = Arc::new(MemoryStore::new());
        let expirer = Expirer::new(store.clone());
        expirer.add("b", 5);
        expirer.add("a", 6);
        assert_eq!(expirer.pending_len(), 2);
        assert_eq!(expirer.flush().unwrap(), 1);
        assert_eq!(expirer.pending_len(), 0);

        expirer.add("a", 7);
        expirer.add("c", 8);
        expirer.flush().unwrap();

        let stored = store
            .get(ns::EXPIRE, bucket_key(bucket_of(5)).as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(stored, b"a\0b\0c");
    }

    #[test]
    fn test_due_buckets() {
        let store = Arc::new(MemoryStore::new());
        let expirer = Expirer::new(store);
        expirer.add("soon", 10);
        expirer.add("later", 0x5000_0000);
        expirer.flush().unwrap();

        assert!(expirer.due_buckets(5).unwrap().is_empty());
        let due = expirer.due_buckets(0x1000_0000).unwrap();
        assert_eq!(due, vec![(0x1000_0000, vec!["soon".to_string()])]);

        expirer.delete_bucket(0x1000_0000).unwrap();
        assert_eq!(expirer.due_buckets(u64::MAX - 1).unwrap().len(), 1);
    }
}
