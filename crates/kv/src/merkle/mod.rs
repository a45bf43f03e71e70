//! Write-time indexed Merkle trees.
//!
//! Each partition owns one tree, namespaced by its 16-bit tree id. Leaves
//! group the keys written within the same ~65 ms bucket of version time;
//! every upper node holds one [`NodeEntry`] per occupied child slot, and
//! its hash is the XOR of the children's hashes.
//!
//! Leaf edits go through a small per-lock-shard cache and reach the store
//! when the slot is evicted or flushed. Parent updates are queued as
//! [`MerkleChange`]s and applied bottom-up by [`MerkleIndex::flush`].

mod node;
mod queue;

pub use node::{
    child_version, decode_leaf, decode_node, encode_leaf, encode_node, leaf_hash, level_end_key,
    level_version, lock_index, node_key, parse_node_key, slot, sort_leaf, xor_hash, Hash,
    LeafEntry, MerkleError, NodeEntry, BUILD, HASH_LEN, HEIGHT, NLOCK,
};
pub use queue::MerkleChange;

use parking_lot::Mutex;
use queue::{batch_key, into_batches, ChangeQueue};
use ringkv_storage::keystore::ns;
use ringkv_storage::KeyStore;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Leaf entries visited per repartition step.
pub const REPARTITION_CAP: usize = 10_240;

/// A child summary as returned by [`MerkleIndex::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    /// Level of the summarized node.
    pub level: u32,
    pub version: u64,
    pub tree_id: u16,
    pub children: u32,
    pub keycount: u64,
    pub hash: Hash,
    /// False while the ring is repartitioning; peers should not descend.
    pub valid: bool,
}

/// One item of a CHECK reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckItem {
    Node(NodeSummary),
    Key(LeafEntry),
}

impl CheckItem {
    /// Keys sit one level below the leaves.
    pub fn level(&self) -> u32 {
        match self {
            Self::Node(n) => n.level,
            Self::Key(_) => HEIGHT + 1,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Node(n) => n.version,
            Self::Key(k) => k.version,
        }
    }
}

/// Result of [`MerkleIndex::gather`].
#[derive(Debug, Default)]
pub struct Gathered {
    pub items: Vec<CheckItem>,
    /// `(level, version)` of nodes whose child counts disagree with their
    /// children.
    pub suspects: Vec<(u32, u64)>,
}

/// One-node cache for [`MerkleIndex::compare`]; siblings in a reply share
/// a parent.
#[derive(Debug, Default)]
pub struct CompareCache {
    node: Option<(u32, u16, u64)>,
    entries: Vec<NodeEntry>,
}

/// Whole leaves read by [`MerkleIndex::scan_leaves`].
#[derive(Debug, Default)]
pub struct LeafChunk {
    pub leaves: Vec<(u64, Vec<LeafEntry>)>,
    /// Where the next scan starts; `None` once the tree is exhausted.
    pub next: Option<u64>,
}

struct CachedLeaf {
    tree_id: u16,
    version: u64,
    key: String,
    entries: Vec<LeafEntry>,
    dirty: bool,
    repair: bool,
}

#[derive(Default)]
struct LeafSlot {
    cached: Option<CachedLeaf>,
}

pub struct MerkleIndex {
    store: Arc<dyn KeyStore>,
    slots: Box<[Mutex<LeafSlot>]>,
    queue: ChangeQueue,
    flushing: Mutex<()>,
    idle: AtomicBool,
}

impl std::fmt::Debug for MerkleIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleIndex")
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl MerkleIndex {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        let slots: Vec<Mutex<LeafSlot>> = (0..NLOCK).map(|_| Mutex::new(LeafSlot::default())).collect();
        Self {
            store,
            slots: slots.into_boxed_slice(),
            queue: ChangeQueue::default(),
            flushing: Mutex::new(()),
            idle: AtomicBool::new(true),
        }
    }

    // -----------------------------------------------------------------------
    // Leaf edits
    // -----------------------------------------------------------------------

    /// Record `key` at `version` in the leaf of tree `tree_id`.
    pub fn add(&self, key: &str, tree_id: u16, shard: u32, version: u64) -> Result<(), MerkleError> {
        let entry = LeafEntry::new(key, version, shard);
        self.with_leaf(tree_id, version, |leaf| {
            if !leaf.entries.contains(&entry) {
                leaf.entries.push(entry);
                sort_leaf(&mut leaf.entries);
                leaf.dirty = true;
            }
        })
    }

    /// Remove `key` at `version` from the leaf of tree `tree_id`.
    pub fn del(&self, key: &str, tree_id: u16, _shard: u32, version: u64) -> Result<(), MerkleError> {
        self.with_leaf(tree_id, version, |leaf| {
            let before = leaf.entries.len();
            leaf.entries.retain(|e| !(e.version == version && e.key == key));
            if leaf.entries.len() != before {
                leaf.dirty = true;
            }
        })
    }

    /// True when the leaf for `version` lists `key` at exactly that version.
    pub fn contains(&self, key: &str, tree_id: u16, version: u64) -> Result<bool, MerkleError> {
        Ok(self
            .leaf_entries(tree_id, version)?
            .iter()
            .any(|e| e.version == version && e.key == key))
    }

    /// Current entries of a leaf, unflushed edits included.
    pub fn leaf_entries(&self, tree_id: u16, version: u64) -> Result<Vec<LeafEntry>, MerkleError> {
        let lv = level_version(HEIGHT, version);
        let slot = self.slots[lock_index(HEIGHT, tree_id, lv)].lock();
        if let Some(c) = &slot.cached {
            if c.tree_id == tree_id && c.version == lv {
                return Ok(c.entries.clone());
            }
        }
        self.read_leaf(&node_key(HEIGHT, tree_id, lv))
    }

    fn with_leaf<R>(
        &self,
        tree_id: u16,
        version: u64,
        f: impl FnOnce(&mut CachedLeaf) -> R,
    ) -> Result<R, MerkleError> {
        self.idle.store(false, Ordering::Relaxed);
        let lv = level_version(HEIGHT, version);
        let mut slot = self.slots[lock_index(HEIGHT, tree_id, lv)].lock();

        let mut leaf = match slot.cached.take() {
            Some(c) if c.tree_id == tree_id && c.version == lv => c,
            other => {
                if let Some(evicted) = other {
                    self.write_leaf(evicted)?;
                }
                let key = node_key(HEIGHT, tree_id, lv);
                let entries = self.read_leaf(&key)?;
                CachedLeaf {
                    tree_id,
                    version: lv,
                    key,
                    entries,
                    dirty: false,
                    repair: false,
                }
            }
        };
        let out = f(&mut leaf);
        slot.cached = Some(leaf);
        Ok(out)
    }

    fn read_leaf(&self, key: &str) -> Result<Vec<LeafEntry>, MerkleError> {
        match self.store.get(ns::MERKLE, key.as_bytes())? {
            None => Ok(Vec::new()),
            Some(bytes) => match decode_leaf(key, &bytes) {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    tracing::warn!("dropping unreadable merkle leaf: {}", e);
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Persist a cached leaf and queue its summary for the parent.
    fn write_leaf(&self, leaf: CachedLeaf) -> Result<(), MerkleError> {
        if !leaf.dirty {
            return Ok(());
        }
        let encoded = encode_leaf(&leaf.entries);
        if leaf.entries.is_empty() {
            self.store.delete(ns::MERKLE, leaf.key.as_bytes())?;
        } else {
            self.store.put(ns::MERKLE, leaf.key.as_bytes(), &encoded)?;
        }
        let n = leaf.entries.len();
        self.queue.push(MerkleChange {
            level: HEIGHT,
            version: leaf.version,
            tree_id: leaf.tree_id,
            children: n as u32,
            keycount: n as u64,
            hash: leaf_hash(&encoded),
            needs_repair: leaf.repair,
        });
        Ok(())
    }

    /// Write back cached leaves. Without `blocking`, slots busy with a
    /// writer are skipped. Returns `(written, skipped)`.
    pub fn flush_leaf_caches(&self, blocking: bool) -> Result<(usize, usize), MerkleError> {
        let mut written = 0;
        let mut skipped = 0;
        for slot in self.slots.iter() {
            let mut guard = if blocking {
                slot.lock()
            } else {
                match slot.try_lock() {
                    Some(g) => g,
                    None => {
                        skipped += 1;
                        continue;
                    }
                }
            };
            if let Some(leaf) = guard.cached.take() {
                if leaf.dirty {
                    written += 1;
                }
                self.write_leaf(leaf)?;
            }
        }
        Ok((written, skipped))
    }

    // -----------------------------------------------------------------------
    // Flushing
    // -----------------------------------------------------------------------

    /// Write back the leaf caches, then drain the change queue bottom-up.
    /// Returns the number of upper nodes rewritten.
    pub fn flush(&self, blocking: bool) -> Result<usize, MerkleError> {
        let _serial = self.flushing.lock();
        let (written, skipped) = self.flush_leaf_caches(blocking)?;

        let changes = self.queue.take();
        if changes.is_empty() {
            if written == 0 && skipped == 0 {
                self.idle.store(true, Ordering::Relaxed);
            }
            return Ok(0);
        }

        let mut batches = into_batches(changes);
        let mut rewritten = 0;
        while let Some(((Reverse(level), parent_version, tree_id), group)) = batches.pop_first() {
            if level == 0 || level - 1 < HEIGHT - BUILD {
                continue;
            }
            let parent = level - 1;
            match self.apply_batch(parent, tree_id, parent_version, &group) {
                Ok(Some(change)) => {
                    rewritten += 1;
                    if parent > HEIGHT - BUILD {
                        batches.entry(batch_key(&change)).or_default().push(change);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // keep what is left for the next pass
                    for change in group.into_iter().chain(batches.into_values().flatten()) {
                        self.queue.push(change);
                    }
                    return Err(e);
                }
            }
        }
        ringkv_metrics::metrics()
            .merkle_changes_applied
            .inc_by(rewritten as u64);
        Ok(rewritten)
    }

    /// Apply one group of child summaries to their shared parent. Returns
    /// the parent's own summary when it changed.
    fn apply_batch(
        &self,
        level: u32,
        tree_id: u16,
        version: u64,
        group: &[MerkleChange],
    ) -> Result<Option<MerkleChange>, MerkleError> {
        let key = node_key(level, tree_id, version);
        let guard = self.slots[lock_index(level, tree_id, version)].lock();

        let mut entries = match self.read_node(&key) {
            Ok(entries) => entries,
            Err(MerkleError::Corrupt { reason, .. }) => {
                tracing::warn!("merkle node {} is corrupt ({}), rebuilding", key, reason);
                self.store.delete(ns::MERKLE, key.as_bytes())?;
                drop(guard);
                self.fix_upper(level, tree_id, version)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut repair = group.iter().any(|c| c.needs_repair);
        let mut changed = false;
        if !is_normalized(&entries) {
            tracing::warn!("merkle node {} has unordered or duplicate slots", key);
            normalize(&mut entries);
            repair = true;
            changed = true;
        }
        for change in group {
            changed |= update_node(&mut entries, change);
        }
        if !changed {
            return Ok(None);
        }
        self.write_node(&key, &entries)?;
        drop(guard);

        Ok(Some(summarize(level, tree_id, version, &entries, repair)))
    }

    fn read_node(&self, key: &str) -> Result<Vec<NodeEntry>, MerkleError> {
        match self.store.get(ns::MERKLE, key.as_bytes())? {
            None => Ok(Vec::new()),
            Some(bytes) => decode_node(key, &bytes),
        }
    }

    /// Like `read_node`, but a corrupt node reads as empty.
    fn read_node_lenient(&self, key: &str) -> Result<Vec<NodeEntry>, MerkleError> {
        match self.read_node(key) {
            Err(MerkleError::Corrupt { reason, .. }) => {
                tracing::warn!("ignoring corrupt merkle node {}: {}", key, reason);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn write_node(&self, key: &str, entries: &[NodeEntry]) -> Result<(), MerkleError> {
        if entries.is_empty() {
            self.store.delete(ns::MERKLE, key.as_bytes())?;
        } else {
            self.store.put(ns::MERKLE, key.as_bytes(), &encode_node(entries))?;
        }
        Ok(())
    }

    /// Nothing buffered and nothing queued as of the last flush.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed) && self.queue.is_empty()
    }

    pub fn pending_changes(&self) -> usize {
        self.queue.len()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Contents of one node: the keys of a leaf, or the child summaries of
    /// an upper node.
    pub fn get(
        &self,
        level: u32,
        tree_id: u16,
        version: u64,
        stable: bool,
    ) -> Result<Vec<CheckItem>, MerkleError> {
        if level > HEIGHT {
            return Ok(Vec::new());
        }
        if level == HEIGHT {
            return Ok(self
                .leaf_entries(tree_id, version)?
                .into_iter()
                .map(CheckItem::Key)
                .collect());
        }
        let entries = self.read_node_lenient(&node_key(level, tree_id, version))?;
        Ok(entries
            .iter()
            .map(|e| {
                CheckItem::Node(NodeSummary {
                    level: level + 1,
                    version: child_version(level, version, e.slot),
                    tree_id,
                    children: e.children,
                    keycount: e.keycount,
                    hash: e.hash,
                    valid: stable,
                })
            })
            .collect())
    }

    /// Answer a CHECK: the node at `level`, then deeper levels of sparse
    /// subtrees while the reply stays small. `max_result` of 1 returns
    /// exactly one level.
    pub fn gather(
        &self,
        level: u32,
        tree_id: u16,
        version: u64,
        max_result: usize,
        stable: bool,
    ) -> Result<Gathered, MerkleError> {
        let max = max_result.max(1);
        let mut items = self.get(level, tree_id, version, stable)?;
        let mut suspects = Vec::new();
        let mut count = items.len();
        if count == 0 || level >= HEIGHT || count >= max {
            return Ok(Gathered { items, suspects });
        }

        let quiescent = self.is_idle();
        let mut cpos = 0;
        for cl in level + 1..=HEIGHT {
            let epos = items.len();
            let mut got = 0;
            let mut next_size = 0usize;
            while cpos < epos {
                let (nver, children, keycount) = match &items[cpos] {
                    CheckItem::Node(n) => (n.version, n.children, n.keycount),
                    CheckItem::Key(_) => {
                        cpos += 1;
                        continue;
                    }
                };
                let more = self.get(cl, tree_id, nver, stable)?;
                if quiescent && more.len() != children as usize {
                    suspects.push((cl - 1, nver));
                }
                next_size += if cl >= HEIGHT - 1 {
                    keycount as usize
                } else {
                    children as usize
                };
                got += more.len();
                items.extend(more);
                cpos += 1;
            }
            count += got;
            if got == 0 || count > max || count + next_size > 2 * max {
                break;
            }
        }
        Ok(Gathered { items, suspects })
    }

    /// True when a peer's summary matches our own entry for that node.
    pub fn compare(&self, summary: &NodeSummary, cache: &mut CompareCache) -> Result<bool, MerkleError> {
        if summary.level == 0 || summary.level > HEIGHT {
            return Ok(false);
        }
        let parent = summary.level - 1;
        let pver = level_version(parent, summary.version);
        let id = (parent, summary.tree_id, pver);
        if cache.node != Some(id) {
            cache.entries = self.read_node_lenient(&node_key(parent, summary.tree_id, pver))?;
            cache.node = Some(id);
        }
        let s = slot(summary.level, summary.version);
        Ok(cache
            .entries
            .iter()
            .any(|e| e.slot == s && e.hash == summary.hash))
    }

    /// Read whole leaves of `tree_id` starting at version `cursor`, until
    /// at least `cap` entries have been collected.
    pub fn scan_leaves(&self, tree_id: u16, cursor: u64, cap: usize) -> Result<LeafChunk, MerkleError> {
        self.flush_leaf_caches(true)?;

        let start = node_key(HEIGHT, tree_id, cursor);
        let end = level_end_key(HEIGHT, tree_id);
        let mut leaves: Vec<(u64, Vec<LeafEntry>)> = Vec::new();
        let mut total = 0usize;
        let mut capped = false;
        self.store
            .range(ns::MERKLE, start.as_bytes(), end.as_bytes(), &mut |k, v| {
                let Some((_, _, version)) = parse_node_key(k) else {
                    return true;
                };
                match decode_leaf(&String::from_utf8_lossy(k), v) {
                    Ok(entries) => {
                        total += entries.len();
                        leaves.push((version, entries));
                    }
                    Err(e) => tracing::warn!("skipping unreadable merkle leaf: {}", e),
                }
                if total >= cap {
                    capped = true;
                    return false;
                }
                true
            })?;

        let next = if capped {
            leaves.last().and_then(|(v, _)| v.checked_add(1 << 16))
        } else {
            None
        };
        Ok(LeafChunk { leaves, next })
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    /// Repair the node at `level`. Leaves drop duplicates and entries for
    /// which `holds` is false; upper nodes are recomputed from their
    /// children, dropping orphaned slots. Returns whether anything changed.
    pub fn fix(
        &self,
        tree_id: u16,
        level: u32,
        version: u64,
        holds: &dyn Fn(&LeafEntry) -> bool,
    ) -> Result<bool, MerkleError> {
        if level > HEIGHT {
            return Ok(false);
        }
        if level == HEIGHT {
            return self.fix_leaf(tree_id, version, holds);
        }
        let mut changed = false;
        if level == HEIGHT - 1 {
            for s in 0..16u8 {
                changed |= self.fix_leaf(tree_id, child_version(level, version, s), holds)?;
            }
        }
        changed |= self.fix_upper(level, tree_id, version)?;
        Ok(changed)
    }

    fn fix_leaf(
        &self,
        tree_id: u16,
        version: u64,
        holds: &dyn Fn(&LeafEntry) -> bool,
    ) -> Result<bool, MerkleError> {
        // `holds` reads records; keep it outside the slot lock
        let current = self.leaf_entries(tree_id, version)?;
        if current.is_empty() {
            return Ok(false);
        }
        let dropped: Vec<LeafEntry> = current.iter().filter(|e| !holds(e)).cloned().collect();

        let changed = self.with_leaf(tree_id, version, |leaf| {
            let before = leaf.entries.clone();
            leaf.entries.retain(|e| !dropped.contains(e));
            sort_leaf(&mut leaf.entries);
            leaf.entries.dedup();
            if leaf.entries != before {
                leaf.dirty = true;
                leaf.repair = true;
                true
            } else {
                false
            }
        })?;
        if changed {
            tracing::warn!(
                "merkle leaf {} repaired, dropped {} entries",
                node_key(HEIGHT, tree_id, version),
                current.len() - self.leaf_entries(tree_id, version)?.len()
            );
            ringkv_metrics::metrics().merkle_fixes.inc();
        }
        Ok(changed)
    }

    fn fix_upper(&self, level: u32, tree_id: u16, version: u64) -> Result<bool, MerkleError> {
        let lv = level_version(level, version);

        // child stats first; they take their own locks
        let mut fresh = Vec::new();
        for s in 0..16u8 {
            let cv = child_version(level, lv, s);
            let stats = if level + 1 == HEIGHT {
                let entries = self.leaf_entries(tree_id, cv)?;
                (!entries.is_empty()).then(|| {
                    let n = entries.len();
                    (n as u32, n as u64, leaf_hash(&encode_leaf(&entries)))
                })
            } else {
                let entries = self.read_node_lenient(&node_key(level + 1, tree_id, cv))?;
                (!entries.is_empty()).then(|| {
                    (
                        entries.len() as u32,
                        entries.iter().map(|e| e.keycount).sum::<u64>(),
                        xor_hash(entries.iter().map(|e| &e.hash)),
                    )
                })
            };
            if let Some((children, keycount, hash)) = stats {
                fresh.push(NodeEntry {
                    slot: s,
                    children,
                    keycount,
                    hash,
                });
            }
        }

        let key = node_key(level, tree_id, lv);
        let guard = self.slots[lock_index(level, tree_id, lv)].lock();
        let current = self.read_node_lenient(&key)?;
        if current == fresh {
            return Ok(false);
        }
        self.write_node(&key, &fresh)?;
        drop(guard);

        tracing::warn!(
            "merkle node {} repaired: {} slots -> {} slots",
            key,
            current.len(),
            fresh.len()
        );
        ringkv_metrics::metrics().merkle_fixes.inc();
        self.queue
            .push(summarize(level, tree_id, lv, &fresh, true));
        Ok(true)
    }

    /// Drop every node, cached leaf and queued change.
    pub fn clear(&self) -> Result<usize, MerkleError> {
        for slot in self.slots.iter() {
            slot.lock().cached = None;
        }
        self.queue.clear();

        let mut keys = Vec::new();
        self.store.range(ns::MERKLE, b"", b"", &mut |k, _| {
            keys.push(k.to_vec());
            true
        })?;
        for k in &keys {
            self.store.delete(ns::MERKLE, k)?;
        }
        Ok(keys.len())
    }
}

// ---------------------------------------------------------------------------
// Node editing
// ---------------------------------------------------------------------------

/// Apply one child summary; returns whether the entry list changed.
fn update_node(entries: &mut Vec<NodeEntry>, change: &MerkleChange) -> bool {
    let s = slot(change.level, change.version);
    let updated = NodeEntry {
        slot: s,
        children: change.children,
        keycount: change.keycount,
        hash: change.hash,
    };
    match entries.binary_search_by_key(&s, |e| e.slot) {
        Ok(i) if change.children == 0 => {
            entries.remove(i);
            true
        }
        Ok(i) => {
            if entries[i] == updated {
                false
            } else {
                entries[i] = updated;
                true
            }
        }
        Err(_) if change.children == 0 => false,
        Err(i) => {
            entries.insert(i, updated);
            true
        }
    }
}

fn is_normalized(entries: &[NodeEntry]) -> bool {
    entries.windows(2).all(|w| w[0].slot < w[1].slot) && entries.iter().all(|e| e.slot < 16)
}

/// Sort by slot, keep the last entry written for each slot, drop slots
/// that cannot exist.
fn normalize(entries: &mut Vec<NodeEntry>) {
    entries.retain(|e| e.slot < 16);
    entries.reverse();
    entries.sort_by_key(|e| e.slot);
    entries.dedup_by_key(|e| e.slot);
}

fn summarize(level: u32, tree_id: u16, version: u64, entries: &[NodeEntry], repair: bool) -> MerkleChange {
    MerkleChange {
        level,
        version: level_version(level, version),
        tree_id,
        children: entries.len() as u32,
        keycount: entries.iter().map(|e| e.keycount).sum(),
        hash: xor_hash(entries.iter().map(|e| &e.hash)),
        needs_repair: repair,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_storage::MemoryStore;

    fn index() -> (Arc<MemoryStore>, MerkleIndex) {
        let store = Arc::new(MemoryStore::new());
        let merkle = MerkleIndex::new(store.clone());
        (store, merkle)
    }

    fn leaf_summary(merkle: &MerkleIndex, tree: u16, version: u64) -> Option<NodeSummary> {
        merkle
            .get(HEIGHT - 1, tree, version, true)
            .unwrap()
            .into_iter()
            .find_map(|item| match item {
                CheckItem::Node(n) if n.version == level_version(HEIGHT, version) => Some(n),
                _ => None,
            })
    }

    fn root(merkle: &MerkleIndex, tree: u16) -> Vec<CheckItem> {
        merkle.get(0, tree, 0, true).unwrap()
    }

    #[test]
    fn test_add_get_del() {
        let (_store, merkle) = index();
        merkle.add("k1", 5, 9, 1000).unwrap();

        let items = merkle.get(HEIGHT, 5, 1000, true).unwrap();
        assert_eq!(items, vec![CheckItem::Key(LeafEntry::new("k1", 1000, 9))]);

        merkle.del("k1", 5, 9, 1000).unwrap();
        assert!(merkle.get(HEIGHT, 5, 1000, true).unwrap().is_empty());
    }

    #[test]
    fn test_parent_keycount_follows_flush() {
        let (_store, merkle) = index();
        merkle.add("k1", 5, 9, 1000).unwrap();
        merkle.add("k2", 5, 9, 1001).unwrap();
        merkle.flush(true).unwrap();
        assert_eq!(leaf_summary(&merkle, 5, 1000).unwrap().keycount, 2);

        merkle.del("k1", 5, 9, 1000).unwrap();
        // the parent only learns about it on flush
        assert_eq!(leaf_summary(&merkle, 5, 1000).unwrap().keycount, 2);
        merkle.flush(true).unwrap();
        assert_eq!(leaf_summary(&merkle, 5, 1000).unwrap().keycount, 1);

        merkle.del("k2", 5, 9, 1001).unwrap();
        merkle.flush(true).unwrap();
        assert!(leaf_summary(&merkle, 5, 1000).is_none());
        assert!(root(&merkle, 5).is_empty());
    }

    #[test]
    fn test_root_aggregates_whole_tree() {
        let (_store, merkle) = index();
        let versions = [1u64 << 20, 5 << 30, 9 << 40, 0xF << 60];
        for (i, v) in versions.iter().enumerate() {
            merkle.add(&format!("k{}", i), 3, 0, *v).unwrap();
        }
        merkle.flush(true).unwrap();

        let root = root(&merkle, 3);
        let total: u64 = root
            .iter()
            .map(|item| match item {
                CheckItem::Node(n) => n.keycount,
                CheckItem::Key(_) => 0,
            })
            .sum();
        assert_eq!(total, 4);
        // other trees are untouched
        assert!(merkle.get(0, 4, 0, true).unwrap().is_empty());
    }

    #[test]
    fn test_incremental_hash_matches_fresh_build() {
        let (_s1, incremental) = index();
        let (_s2, fresh) = index();

        let mut kept = Vec::new();
        for i in 0..200u64 {
            let version = 1_700_000_000_000_000 + i * 977_777;
            let key = format!("key-{}", i);
            incremental.add(&key, 1, i as u32, version).unwrap();
            if i % 4 == 0 {
                incremental.flush(false).unwrap();
            }
            if i % 3 == 0 {
                incremental.del(&key, 1, i as u32, version).unwrap();
            } else {
                kept.push((key, i as u32, version));
            }
        }
        incremental.flush(true).unwrap();

        for (key, shard, version) in &kept {
            fresh.add(key, 1, *shard, *version).unwrap();
        }
        fresh.flush(true).unwrap();

        assert_eq!(root(&incremental, 1), root(&fresh, 1));
        assert!(!root(&fresh, 1).is_empty());
    }

    #[test]
    fn test_leaf_reads_see_unflushed_writes() {
        let (store, merkle) = index();
        merkle.add("a", 0, 0, 1 << 16).unwrap();
        assert!(store
            .get(ns::MERKLE, node_key(HEIGHT, 0, 1 << 16).as_bytes())
            .unwrap()
            .is_none());
        assert!(merkle.contains("a", 0, 1 << 16).unwrap());
        assert_eq!(merkle.get(HEIGHT, 0, 1 << 16, true).unwrap().len(), 1);

        merkle.flush_leaf_caches(true).unwrap();
        assert!(store
            .get(ns::MERKLE, node_key(HEIGHT, 0, 1 << 16).as_bytes())
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_compare_detects_divergence() {
        let (_s1, ours) = index();
        let (_s2, theirs) = index();
        ours.add("same", 0, 0, 5 << 16).unwrap();
        theirs.add("same", 0, 0, 5 << 16).unwrap();
        theirs.add("extra", 0, 0, 7 << 40).unwrap();
        ours.flush(true).unwrap();
        theirs.flush(true).unwrap();

        let mut cache = CompareCache::default();
        let mut mismatched = 0;
        for item in theirs.get(0, 0, 0, true).unwrap() {
            if let CheckItem::Node(n) = item {
                if !ours.compare(&n, &mut cache).unwrap() {
                    mismatched += 1;
                }
            }
        }
        assert_eq!(mismatched, 1);
    }

    #[test]
    fn test_gather_one_level_at_a_time() {
        let (_store, merkle) = index();
        merkle.add("k", 2, 0, 0x1234_5678_0000).unwrap();
        merkle.flush(true).unwrap();

        let g = merkle.gather(0, 2, 0, 1, true).unwrap();
        assert_eq!(g.items.len(), 1);
        assert_eq!(g.items[0].level(), 1);

        // a sparse tree collapses into a single reply
        let g = merkle.gather(0, 2, 0, 64, true).unwrap();
        assert!(g.items.iter().any(|i| matches!(i, CheckItem::Key(k) if k.key == "k")));
        assert_eq!(g.items.iter().map(CheckItem::level).max(), Some(HEIGHT + 1));
        assert!(g.suspects.is_empty());
    }

    #[test]
    fn test_gather_reports_count_mismatch() {
        let (store, merkle) = index();
        merkle.add("k", 2, 0, 3 << 16).unwrap();
        merkle.flush(true).unwrap();
        merkle.flush(true).unwrap();

        // lose the leaf behind the index's back
        store
            .delete(ns::MERKLE, node_key(HEIGHT, 2, 3 << 16).as_bytes())
            .unwrap();
        let g = merkle.gather(0, 2, 0, 64, true).unwrap();
        assert_eq!(g.suspects, vec![(HEIGHT - 1, level_version(HEIGHT, 3 << 16))]);

        let (level, version) = g.suspects[0];
        assert!(merkle.fix(2, level, version, &|_| true).unwrap());
        merkle.flush(true).unwrap();
        assert!(root(&merkle, 2).is_empty());
    }

    #[test]
    fn test_fix_leaf_drops_dangling_and_duplicates() {
        let (store, merkle) = index();
        let key = node_key(HEIGHT, 1, 9 << 16);
        let dup = vec![
            LeafEntry::new("a", 9 << 16, 0),
            LeafEntry::new("b", (9 << 16) + 1, 0),
            LeafEntry::new("a", 9 << 16, 0),
        ];
        store.put(ns::MERKLE, key.as_bytes(), &encode_leaf(&dup)).unwrap();

        let changed = merkle.fix(1, HEIGHT, 9 << 16, &|e| e.key != "b").unwrap();
        assert!(changed);
        assert_eq!(
            merkle.leaf_entries(1, 9 << 16).unwrap(),
            vec![LeafEntry::new("a", 9 << 16, 0)]
        );
        assert!(!merkle.fix(1, HEIGHT, 9 << 16, &|_| true).unwrap());
    }

    #[test]
    fn test_fix_upper_resorts_and_dedupes() {
        let (store, merkle) = index();
        merkle.add("a", 0, 0, 1 << 16).unwrap();
        merkle.add("b", 0, 0, 2 << 16).unwrap();
        merkle.flush(true).unwrap();

        let key = node_key(HEIGHT - 1, 0, 0);
        let mut entries = decode_node(&key, &store.get(ns::MERKLE, key.as_bytes()).unwrap().unwrap()).unwrap();
        let good = entries.clone();
        entries.reverse();
        entries.push(entries[0]);
        entries.push(NodeEntry {
            slot: 7,
            children: 1,
            keycount: 1,
            hash: [9; HASH_LEN],
        });
        store.put(ns::MERKLE, key.as_bytes(), &encode_node(&entries)).unwrap();

        assert!(merkle.fix(0, HEIGHT - 1, 0, &|_| true).unwrap());
        let repaired = decode_node(&key, &store.get(ns::MERKLE, key.as_bytes()).unwrap().unwrap()).unwrap();
        assert_eq!(repaired, good);
    }

    #[test]
    fn test_scan_leaves_in_chunks() {
        let (_store, merkle) = index();
        for i in 0..10u64 {
            merkle.add(&format!("k{}", i), 4, 0, i << 16).unwrap();
        }
        merkle.add("other-tree", 5, 0, 1 << 16).unwrap();

        let first = merkle.scan_leaves(4, 0, 4).unwrap();
        assert_eq!(first.leaves.len(), 4);
        let next = first.next.unwrap();
        assert_eq!(next, 4 << 16);

        let rest = merkle.scan_leaves(4, next, 100).unwrap();
        assert_eq!(rest.leaves.len(), 6);
        assert!(rest.next.is_none());
        assert!(rest.leaves.iter().all(|(_, e)| e[0].key != "other-tree"));
    }

    #[test]
    fn test_clear() {
        let (_store, merkle) = index();
        merkle.add("a", 0, 0, 1 << 16).unwrap();
        merkle.flush(true).unwrap();
        assert!(merkle.clear().unwrap() > 0);
        assert!(root(&merkle, 0).is_empty());
        assert!(merkle.leaf_entries(0, 1 << 16).unwrap().is_empty());
    }
}
