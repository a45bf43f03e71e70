//! Storage engines: a bare memtable and WAL + memtable.
//!
//! All writes to a `WalStore` go through the WAL first (for durability),
//! then into the memtable (for reads and ordered scans).

use crate::keystore::{full_key, KeyStore, StorageError};
use crate::memtable::Memtable;
use crate::wal::{FsyncPolicy, Wal, WalEntry};
use parking_lot::{Mutex, RwLock};
use std::path::Path;

/// Scan batch size for `range`; the visitor runs between batches with no
/// lock held.
const SCAN_BATCH: usize = 256;

/// Log entries per live key before the WAL is rewritten.
const COMPACT_RATIO: u64 = 4;
/// Never compact logs smaller than this.
const COMPACT_MIN_ENTRIES: u64 = 100_000;

fn scan(
    table: impl Fn(&[u8], Option<&[u8]>, usize) -> Vec<(Vec<u8>, Vec<u8>)>,
    sub: u8,
    start: &[u8],
    end: &[u8],
    visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
) {
    let end_key = if end.is_empty() {
        vec![sub.wrapping_add(1)]
    } else {
        full_key(sub, end)
    };
    // namespace 0xff has no successor byte
    let end_bound = if end.is_empty() && sub == u8::MAX {
        None
    } else {
        Some(end_key.as_slice())
    };

    let mut cursor = full_key(sub, start);
    loop {
        let batch = table(&cursor, end_bound, SCAN_BATCH);
        let exhausted = batch.len() < SCAN_BATCH;
        let Some((last, _)) = batch.last() else {
            return;
        };
        let mut next = last.clone();
        next.push(0);
        for (k, v) in &batch {
            if !visit(&k[1..], v) {
                return;
            }
        }
        if exhausted {
            return;
        }
        cursor = next;
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Volatile store; contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<Memtable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys across all namespaces.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl KeyStore for MemoryStore {
    fn get(&self, sub: u8, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.table.read().get(&full_key(sub, key)).map(<[u8]>::to_vec))
    }

    fn put(&self, sub: u8, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.table.write().put(full_key(sub, key), value.to_vec());
        Ok(())
    }

    fn delete(&self, sub: u8, key: &[u8]) -> Result<(), StorageError> {
        self.table.write().remove(&full_key(sub, key));
        Ok(())
    }

    fn range(
        &self,
        sub: u8,
        start: &[u8],
        end: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StorageError> {
        scan(
            |s, e, n| self.table.read().range(s, e, n),
            sub,
            start,
            end,
            visit,
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WalStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WalInner {
    memtable: Memtable,
    wal: Wal,
}

/// Durable store: WAL replay rebuilds the memtable on open.
#[derive(Debug)]
pub struct WalStore {
    inner: RwLock<WalInner>,
    /// Serializes compaction with itself.
    compacting: Mutex<()>,
}

impl WalStore {
    /// Open or create a store at the given directory.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        let mut memtable = Memtable::new();
        for entry in Wal::replay(&wal_path)? {
            match entry.decode()? {
                (key, Some(value)) => memtable.put(key, value),
                (key, None) => {
                    memtable.remove(&key);
                }
            }
        }

        let wal = Wal::open(&wal_path, fsync)?;

        tracing::info!(
            "storage engine opened: {} keys recovered from WAL at {:?}",
            memtable.len(),
            wal_path
        );

        Ok(Self {
            inner: RwLock::new(WalInner { memtable, wal }),
            compacting: Mutex::new(()),
        })
    }

    /// Number of keys across all namespaces.
    pub fn len(&self) -> usize {
        self.inner.read().memtable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().memtable.is_empty()
    }

    /// Rewrite the WAL to hold exactly one entry per live key.
    pub fn compact(&self) -> Result<(), StorageError> {
        let _guard = self.compacting.lock();
        let mut inner = self.inner.write();
        let WalInner { memtable, wal } = &mut *inner;
        let before = wal.entries_written();
        wal.rewrite(memtable.iter().map(|(k, v)| WalEntry::put(k, v)))?;
        tracing::info!(
            "compacted WAL at {:?}: {} appended entries folded into {} keys",
            wal.path(),
            before,
            memtable.len()
        );
        Ok(())
    }

    fn needs_compaction(inner: &WalInner) -> bool {
        let written = inner.wal.entries_written();
        written >= COMPACT_MIN_ENTRIES
            && written >= COMPACT_RATIO * inner.memtable.len() as u64
    }

    fn append(&self, entry: WalEntry, apply: impl FnOnce(&mut Memtable)) -> Result<(), StorageError> {
        let compact = {
            let mut inner = self.inner.write();
            inner.wal.append(&entry)?;
            apply(&mut inner.memtable);
            Self::needs_compaction(&inner)
        };
        if compact {
            self.compact()?;
        }
        Ok(())
    }
}

impl KeyStore for WalStore {
    fn get(&self, sub: u8, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .inner
            .read()
            .memtable
            .get(&full_key(sub, key))
            .map(<[u8]>::to_vec))
    }

    fn put(&self, sub: u8, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let full = full_key(sub, key);
        let entry = WalEntry::put(&full, value);
        self.append(entry, |m| m.put(full, value.to_vec()))
    }

    fn delete(&self, sub: u8, key: &[u8]) -> Result<(), StorageError> {
        let full = full_key(sub, key);
        let entry = WalEntry::delete(&full);
        self.append(entry, |m| {
            m.remove(&full);
        })
    }

    fn range(
        &self,
        sub: u8,
        start: &[u8],
        end: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StorageError> {
        scan(
            |s, e, n| self.inner.read().memtable.range(s, e, n),
            sub,
            start,
            end,
            visit,
        );
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.inner.write().wal.sync()?;
        Ok(())
    }
}
