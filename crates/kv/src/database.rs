//! One named database: the versioned read/write path.
//!
//! Every accepted write replaces the stored record and moves the key's
//! Merkle leaf entry from the old version to the new one under the same
//! per-shard lock, so the record and its tree reflection never disagree
//! for a reader that takes that lock too.

use crate::expire::Expirer;
use crate::merkle::{CheckItem, LeafEntry, MerkleError, MerkleIndex, HEIGHT};
use crate::registry::ServerRegistry;
use crate::ring::Ring;
use parking_lot::Mutex;
use ringkv_common::{now_micros, shard_hash, Datum, KeyVersion, PutStatus, VersionClock, WantIt};
use ringkv_storage::keystore::ns;
use ringkv_storage::{KeyStore, Record, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Record lock shards.
pub const NDBLOCK: usize = 1029;
/// CHECK reply size when the requester does not ask for one.
pub const DEFAULT_CHECK_RESULT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("merkle error: {0}")]
    Merkle(#[from] MerkleError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("transform failed: {0}")]
    Failed(String),
}

/// The embedded read-modify-write facility. Runs only on the node that
/// first accepts a write; replicas receive the computed value.
pub trait Transform: Send + Sync + 'static {
    /// Compute the new value from `program` and the current value, if any.
    fn apply(&self, program: &[u8], current: Option<&[u8]>) -> Result<Vec<u8>, TransformError>;
}

pub struct Database {
    name: String,
    store: Arc<dyn KeyStore>,
    ring: Ring,
    merkle: MerkleIndex,
    expirer: Expirer,
    locks: Box<[Mutex<()>]>,
    clock: VersionClock,
    /// Default time to live in microseconds, 0 = none.
    default_ttl: u64,
    transform: Option<Arc<dyn Transform>>,
    uptodate: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn new(name: &str, store: Arc<dyn KeyStore>, registry: Arc<ServerRegistry>) -> Self {
        let locks: Vec<Mutex<()>> = (0..NDBLOCK).map(|_| Mutex::new(())).collect();
        Self {
            name: name.to_string(),
            ring: Ring::new(name, registry, store.clone()),
            merkle: MerkleIndex::new(store.clone()),
            expirer: Expirer::new(store.clone()),
            store,
            locks: locks.into_boxed_slice(),
            clock: VersionClock::new(),
            default_ttl: 0,
            transform: None,
            uptodate: AtomicBool::new(false),
        }
    }

    pub fn with_default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl = secs.saturating_mul(1_000_000);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn merkle(&self) -> &MerkleIndex {
        &self.merkle
    }

    pub fn expirer(&self) -> &Expirer {
        &self.expirer
    }

    /// Default TTL in microseconds.
    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    /// Completed a full anti-entropy cycle since startup.
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Relaxed)
    }

    pub fn set_uptodate(&self, uptodate: bool) {
        self.uptodate.store(uptodate, Ordering::Relaxed);
    }

    /// Merkle tree id for records at `shard` under the current ring.
    pub fn tree_of(&self, shard: u32) -> u16 {
        self.ring.tree_id(self.ring.partition_of(shard))
    }

    fn lock_for(&self, shard: u32) -> &Mutex<()> {
        &self.locks[shard as usize % NDBLOCK]
    }

    /// The stored record, or `None`. Malformed records read as absent.
    fn read_record(&self, key: &str) -> Result<Option<Record>, DbError> {
        let Some(bytes) = self.store.get(ns::DATA, key.as_bytes())? else {
            return Ok(None);
        };
        match Record::decode(&bytes) {
            Ok(rec) => Ok(Some(rec)),
            Err(e) => {
                tracing::warn!("database {}: malformed record for {:?}: {}", self.name, key, e);
                Ok(None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Apply one write. Fills in `version` and `shard` when absent and
    /// replaces a transform program by the value it computed, so the datum
    /// can be replicated as-is afterwards.
    pub fn put(&self, datum: &mut Datum) -> Result<PutStatus, DbError> {
        let now = now_micros();
        if datum.version == 0 {
            datum.version = self.clock.next();
        }
        let shard = *datum.shard.get_or_insert_with(|| shard_hash(&datum.key));

        let expire = if datum.expire != 0 {
            datum.expire
        } else if self.default_ttl != 0 {
            now.saturating_add(self.default_ttl)
        } else {
            0
        };
        if expire != 0 && expire <= now {
            return Ok(counted(PutStatus::Old));
        }

        let part = self.ring.partition_of(shard);
        if !self.ring.is_local(part) {
            return Ok(counted(PutStatus::NotMe));
        }
        let tree = self.ring.tree_id(part);

        let guard = self.lock_for(shard).lock();
        let old = self.read_record(&datum.key)?;
        if let Some(o) = &old {
            if o.version >= datum.version {
                return Ok(counted(PutStatus::Have));
            }
        }

        if let Some(program) = datum.program.take() {
            let current = old
                .as_ref()
                .filter(|o| !o.is_tombstone() && !o.is_expired(now))
                .map(|o| o.payload.as_slice());
            let Some(transform) = &self.transform else {
                tracing::warn!("database {}: write to {:?} carries a program but no transform is configured", self.name, datum.key);
                return Ok(counted(PutStatus::Bad));
            };
            match transform.apply(&program, current) {
                Ok(value) => datum.value = Some(value),
                Err(e) => {
                    tracing::warn!("database {}: transform of {:?} failed: {}", self.name, datum.key, e);
                    return Ok(counted(PutStatus::Bad));
                }
            }
        }

        let record = Record::from_value(datum.version, expire, shard, datum.value.clone());
        if let Some(o) = &old {
            self.merkle.del(&datum.key, self.tree_of(o.shard), o.shard, o.version)?;
        }
        self.store
            .put(ns::DATA, datum.key.as_bytes(), &record.encode())?;
        self.merkle.add(&datum.key, tree, shard, datum.version)?;
        drop(guard);

        if datum.expire != 0 {
            self.expirer.add(&datum.key, datum.expire);
        }
        Ok(counted(PutStatus::Done))
    }

    /// Physically delete `key`. A nonzero `version` must match the stored
    /// one exactly; 0 deletes only a record that has expired.
    pub fn remove(&self, key: &str, version: u64) -> Result<bool, DbError> {
        let now = now_micros();
        self.remove_where(key, |rec| {
            if version != 0 {
                rec.version == version
            } else {
                rec.is_expired(now)
            }
        })
    }

    fn remove_where(&self, key: &str, pred: impl Fn(&Record) -> bool) -> Result<bool, DbError> {
        let Some(peek) = self.read_record(key)? else {
            return Ok(false);
        };
        let _guard = self.lock_for(peek.shard).lock();
        let Some(rec) = self.read_record(key)? else {
            return Ok(false);
        };
        if !pred(&rec) {
            return Ok(false);
        }
        self.store.delete(ns::DATA, key.as_bytes())?;
        self.merkle
            .del(key, self.tree_of(rec.shard), rec.shard, rec.version)?;
        ringkv_metrics::metrics().removes.inc();
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The stored record, tombstones included. With `wanted`, only that
    /// exact version is returned.
    pub fn get(&self, key: &str, wanted: Option<u64>) -> Result<Option<Record>, DbError> {
        ringkv_metrics::metrics().gets.inc();
        let Some(rec) = self.read_record(key)? else {
            return Ok(None);
        };
        if let Some(w) = wanted {
            if w != rec.version {
                if self.is_uptodate() {
                    self.drop_stale_leaf(key, &rec, w)?;
                }
                return Ok(None);
            }
        }
        if rec.is_expired(now_micros()) {
            return Ok(None);
        }
        Ok(Some(rec))
    }

    /// Someone asked for a version we do not hold; if our tree still
    /// advertises it, the tree is wrong.
    fn drop_stale_leaf(&self, key: &str, rec: &Record, version: u64) -> Result<(), DbError> {
        let tree = self.tree_of(rec.shard);
        if self.merkle.contains(key, tree, version)? {
            tracing::warn!(
                "database {}: merkle leaf lists {:?} at {} but the record is at {}",
                self.name,
                key,
                version,
                rec.version
            );
            self.merkle.del(key, tree, rec.shard, version)?;
            ringkv_metrics::metrics().merkle_fixes.inc();
        }
        Ok(())
    }

    /// Whether a peer's `version` of `key` is worth fetching.
    pub fn want_it(&self, key: &str, version: u64) -> Result<WantIt, DbError> {
        Ok(match self.read_record(key)? {
            None => WantIt::Want,
            Some(rec) if rec.version < version => WantIt::Want,
            Some(rec) if rec.version == version => WantIt::Have,
            Some(_) => WantIt::LocalNewer,
        })
    }

    /// True when the stored record is at exactly the entry's version.
    pub fn holds(&self, entry: &LeafEntry) -> bool {
        match self.read_record(&entry.key) {
            Ok(Some(rec)) => rec.version == entry.version,
            Ok(None) => false,
            // unsure; keep the entry
            Err(_) => true,
        }
    }

    /// Put `entry` back into the tree if the stored record is still at
    /// that version. Checked under the record lock so a concurrent write
    /// cannot have moved the key on in between. True when it was missing.
    pub fn restore_leaf(&self, entry: &LeafEntry) -> Result<bool, DbError> {
        let Some(peek) = self.read_record(&entry.key)? else {
            return Ok(false);
        };
        let _guard = self.lock_for(peek.shard).lock();
        let Some(rec) = self.read_record(&entry.key)? else {
            return Ok(false);
        };
        if rec.version != entry.version {
            return Ok(false);
        }
        let tree = self.tree_of(rec.shard);
        if self.merkle.contains(&entry.key, tree, rec.version)? {
            return Ok(false);
        }
        self.merkle.add(&entry.key, tree, rec.shard, rec.version)?;
        Ok(true)
    }

    /// Answer a GET: every requested pair still held at that version.
    pub fn fetch_many(&self, keys: &[KeyVersion]) -> Result<Vec<Datum>, DbError> {
        let mut out = Vec::with_capacity(keys.len());
        for kv in keys {
            if let Some(rec) = self.get(&kv.key, Some(kv.version))? {
                out.push(record_to_datum(&kv.key, rec));
            }
        }
        Ok(out)
    }

    /// Answer a CHECK, repairing any node found inconsistent on the way.
    pub fn get_merkle(
        &self,
        level: u32,
        tree_id: u16,
        version: u64,
        max_result: usize,
    ) -> Result<Vec<CheckItem>, DbError> {
        let max = if max_result == 0 {
            DEFAULT_CHECK_RESULT
        } else {
            max_result
        };
        let gathered = self
            .merkle
            .gather(level, tree_id, version, max, self.ring.is_stable())?;
        for (l, v) in gathered.suspects {
            if let Err(e) = self.merkle.fix(tree_id, l, v, &|e| self.holds(e)) {
                tracing::warn!("database {}: merkle repair at level {} failed: {}", self.name, l, e);
            }
        }
        Ok(gathered.items)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    pub fn flush_merkle(&self, blocking: bool) -> Result<usize, DbError> {
        Ok(self.merkle.flush(blocking)?)
    }

    /// Throw the Merkle index away and rebuild it from the stored records.
    pub fn rebuild_merkle(&self) -> Result<usize, DbError> {
        self.merkle.clear()?;
        let mut added = 0;
        let mut failed: Option<DbError> = None;
        self.store.range(ns::DATA, b"", b"", &mut |k, v| {
            let (Ok(key), Ok(rec)) = (std::str::from_utf8(k), Record::decode(v)) else {
                return true;
            };
            match self
                .merkle
                .add(key, self.tree_of(rec.shard), rec.shard, rec.version)
            {
                Ok(()) => {
                    added += 1;
                    true
                }
                Err(e) => {
                    failed = Some(e.into());
                    false
                }
            }
        })?;
        if let Some(e) = failed {
            return Err(e);
        }
        self.merkle.flush(true)?;
        tracing::info!("database {}: merkle index rebuilt, {} keys", self.name, added);
        Ok(added)
    }

    /// Run both expiry sweeps as of `now`. Returns the number of records
    /// removed.
    pub fn expire(&self, now: u64) -> Result<usize, DbError> {
        let mut removed = 0;

        // default TTL: walk the time index up to the cutoff
        if self.default_ttl != 0 {
            let cutoff = crate::merkle::level_version(HEIGHT, now.saturating_sub(self.default_ttl));
            for part in 0..self.ring.num_partitions() {
                removed += self.expire_tree(self.ring.tree_id(part), cutoff, now)?;
            }
        }

        // explicit TTL: due buckets
        self.expirer.flush()?;
        for (bucket, keys) in self.expirer.due_buckets(now)? {
            for key in keys {
                if self.remove_where(&key, |rec| rec.is_expired(now))? {
                    removed += 1;
                }
            }
            self.expirer.delete_bucket(bucket)?;
        }

        if removed > 0 {
            ringkv_metrics::metrics().expired_keys.inc_by(removed as u64);
            tracing::debug!("database {}: expired {} keys", self.name, removed);
        }
        Ok(removed)
    }

    fn expire_tree(&self, tree_id: u16, cutoff: u64, now: u64) -> Result<usize, DbError> {
        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let chunk = self
                .merkle
                .scan_leaves(tree_id, cursor, crate::merkle::REPARTITION_CAP)?;
            for (bucket, entries) in &chunk.leaves {
                if *bucket >= cutoff {
                    return Ok(removed);
                }
                for e in entries {
                    let gone = self.remove_where(&e.key, |rec| {
                        rec.version == e.version && (rec.expire == 0 || rec.is_expired(now))
                    })?;
                    if gone {
                        removed += 1;
                    } else if !self.holds(e) {
                        self.merkle.del(&e.key, tree_id, e.shard, e.version)?;
                    }
                }
            }
            match chunk.next {
                Some(next) if next < cutoff => cursor = next,
                _ => return Ok(removed),
            }
        }
    }
}

fn counted(status: PutStatus) -> PutStatus {
    ringkv_metrics::metrics()
        .puts_by_status
        .with_label_values(&[status.as_str()])
        .inc();
    status
}

/// The wire form of a stored record.
pub fn record_to_datum(key: &str, rec: Record) -> Datum {
    let tombstone = rec.is_tombstone();
    Datum {
        key: key.to_string(),
        value: if tombstone { None } else { Some(rec.payload) },
        version: rec.version,
        shard: Some(rec.shard),
        expire: rec.expire,
        program: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
