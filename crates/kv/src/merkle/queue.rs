//! Pending parent updates and the bottom-up batch order they drain in.

use super::node::{level_version, Hash};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// A not-yet-applied summary of one node, destined for its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleChange {
    /// Level of the node that changed.
    pub level: u32,
    /// That node's level-masked version.
    pub version: u64,
    pub tree_id: u16,
    /// 0 removes the node from its parent.
    pub children: u32,
    pub keycount: u64,
    pub hash: Hash,
    pub needs_repair: bool,
}

/// `(child level descending, parent version ascending, tree)`.
///
/// Every change produced while applying a batch sorts after the batch it
/// came from, so one pass over the map climbs the tree.
pub(crate) type BatchKey = (Reverse<u32>, u64, u16);

pub(crate) fn batch_key(change: &MerkleChange) -> BatchKey {
    (
        Reverse(change.level),
        level_version(change.level.saturating_sub(1), change.version),
        change.tree_id,
    )
}

/// Group changes by destination node, keeping arrival order inside each
/// group so later summaries of the same child win.
pub(crate) fn into_batches(changes: Vec<MerkleChange>) -> BTreeMap<BatchKey, Vec<MerkleChange>> {
    let mut batches: BTreeMap<BatchKey, Vec<MerkleChange>> = BTreeMap::new();
    for change in changes {
        batches.entry(batch_key(&change)).or_default().push(change);
    }
    batches
}

/// The queue writers append to. The flusher swaps the whole vector out so
/// writers never wait on a flush.
#[derive(Debug, Default)]
pub(crate) struct ChangeQueue {
    pending: Mutex<Vec<MerkleChange>>,
}

impl ChangeQueue {
    pub(crate) fn push(&self, change: MerkleChange) {
        self.pending.lock().push(change);
    }

    pub(crate) fn take(&self) -> Vec<MerkleChange> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub(crate) fn clear(&self) {
        self.pending.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::node::HASH_LEN;

    fn change(level: u32, version: u64, tree_id: u16) -> MerkleChange {
        MerkleChange {
            level,
            version,
            tree_id,
            children: 1,
            keycount: 1,
            hash: [0; HASH_LEN],
            needs_repair: false,
        }
    }

    #[test]
    fn test_batches_drain_bottom_up() {
        let mut batches = into_batches(vec![
            change(11, 0x5_0000_0000, 1),
            change(12, 0x2_0000, 1),
            change(12, 0x1_0000, 1),
            change(12, 0x1_0000_0000, 1),
        ]);
        // Both leaves under the same level-11 node share a batch.
        assert_eq!(batches.len(), 3);

        let (first, group) = batches.pop_first().unwrap();
        assert_eq!(first, (Reverse(12), 0, 1));
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].version, 0x2_0000);

        let (second, _) = batches.pop_first().unwrap();
        assert_eq!(second.0, Reverse(12));
        assert_eq!(second.1, 0x1_0000_0000);

        let (third, _) = batches.pop_first().unwrap();
        assert_eq!(third.0, Reverse(11));
    }

    #[test]
    fn test_queue_swap() {
        let q = ChangeQueue::default();
        q.push(change(12, 1, 0));
        q.push(change(12, 2, 0));
        assert_eq!(q.len(), 2);
        let taken = q.take();
        assert_eq!(taken.len(), 2);
        assert!(q.is_empty());
    }
}
