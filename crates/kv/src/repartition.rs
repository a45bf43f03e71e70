//! Moves data after a ring change.
//!
//! Walks every Merkle tree of the layout the data is currently in. Keys
//! whose partition is no longer local are handed to the new owners and
//! removed once one of them confirms; keys that stay local but land in a
//! different partition have their leaf entries moved to the new tree.
//! Progress is checkpointed per partition so a restart resumes where it
//! stopped.

use crate::database::{record_to_datum, Database, DbError};
use crate::distrib::{DistRequest, Distributor};
use crate::merkle::REPARTITION_CAP;
use crate::peer_client::PeerClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every partition is laid out for the current ring version.
    Stable,
    /// Stopped early for a reconfigure or shutdown.
    Paused,
    /// Some hand-offs were not confirmed; try again later.
    Incomplete,
}

/// Result of walking one tree from a cursor.
enum Walk {
    Done,
    Paused,
    Incomplete,
}

/// Run the repartitioner until the ring is stable, a reconfigure asks it to
/// pause, or a hand-off cannot be confirmed.
pub async fn repartition_pass<C: PeerClient>(
    db: &Database,
    distributor: &Distributor<C>,
    token: &CancellationToken,
) -> Result<PassOutcome, DbError> {
    let ring = db.ring();
    let _run = ring.acquire_run().await;
    if ring.is_stable() {
        return Ok(PassOutcome::Stable);
    }

    let version = ring.version();
    let new_bits = ring.bits();
    let old_bits = ring.load_checkpoint("bits", 0)? as u32;
    tracing::debug!(
        "database {}: repartitioning for {} ({} -> {} bits)",
        db.name(),
        version,
        old_bits,
        new_bits
    );

    let outcome = if old_bits > new_bits {
        contract(db, distributor, token, version, old_bits, new_bits).await?
    } else {
        shuffle(db, distributor, token, version).await?
    };
    if outcome == PassOutcome::Stable {
        ring.mark_stable(version)?;
    }
    Ok(outcome)
}

/// Same or more bits: each new partition's tree holds everything that
/// might have to move out of it.
async fn shuffle<C: PeerClient>(
    db: &Database,
    distributor: &Distributor<C>,
    token: &CancellationToken,
    version: u64,
) -> Result<PassOutcome, DbError> {
    let ring = db.ring();
    let mut outcome = PassOutcome::Stable;
    for idx in 0..ring.num_partitions() {
        let Some(p) = ring.partition(idx) else {
            continue;
        };
        if p.stable_version == version {
            continue;
        }
        let Some(cursor) = resume_cursor(db, idx, version)? else {
            ring.partition_done(idx, version)?;
            continue;
        };
        match walk_tree(db, distributor, token, p.tree_id(), cursor, Some(idx), version).await? {
            Walk::Done => ring.partition_done(idx, version)?,
            Walk::Paused => return Ok(PassOutcome::Paused),
            Walk::Incomplete => outcome = PassOutcome::Incomplete,
        }
    }
    Ok(outcome)
}

/// Fewer bits: walk every old partition's tree. Only the first old
/// partition of each new one has somewhere to keep a checkpoint.
async fn contract<C: PeerClient>(
    db: &Database,
    distributor: &Distributor<C>,
    token: &CancellationToken,
    version: u64,
    old_bits: u32,
    new_bits: u32,
) -> Result<PassOutcome, DbError> {
    let ring = db.ring();
    let shift = old_bits - new_bits;
    let mut outcome = PassOutcome::Stable;
    let mut group_ok = true;

    for idx in 0..(1usize << old_bits) {
        let shard_start = ((idx as u64) << (32 - old_bits)) as u32;
        let tree = (shard_start >> 16) as u16;
        let nidx = idx >> shift;
        let Some(p) = ring.partition(nidx) else {
            continue;
        };
        let first = p.shard_start == shard_start;
        let last = (idx + 1) >> shift != nidx;
        if first {
            group_ok = true;
        }
        if p.stable_version == version {
            continue;
        }

        let cursor = if first {
            resume_cursor(db, nidx, version)?
        } else {
            Some(0)
        };
        if let Some(cursor) = cursor {
            let slot = first.then_some(nidx);
            match walk_tree(db, distributor, token, tree, cursor, slot, version).await? {
                Walk::Done => {}
                Walk::Paused => return Ok(PassOutcome::Paused),
                Walk::Incomplete => {
                    group_ok = false;
                    outcome = PassOutcome::Incomplete;
                }
            }
        }
        if last && group_ok {
            ring.partition_done(nidx, version)?;
        }
    }
    Ok(outcome)
}

/// Where to start on partition `slot`: `None` when its checkpoints say it
/// is already done for `version`.
fn resume_cursor(db: &Database, slot: usize, version: u64) -> Result<Option<u64>, DbError> {
    let ring = db.ring();
    if ring.load_checkpoint("ver", slot)? == version {
        return Ok(None);
    }
    if ring.load_checkpoint("nver", slot)? == version {
        return Ok(Some(ring.load_checkpoint("check", slot)?));
    }
    Ok(Some(0))
}

/// Walk `tree` from `cursor` in capped chunks, checkpointing into `slot`
/// after each one.
async fn walk_tree<C: PeerClient>(
    db: &Database,
    distributor: &Distributor<C>,
    token: &CancellationToken,
    tree: u16,
    mut cursor: u64,
    slot: Option<usize>,
    version: u64,
) -> Result<Walk, DbError> {
    let ring = db.ring();
    loop {
        if ring.pause_requested() || token.is_cancelled() {
            return Ok(Walk::Paused);
        }
        let chunk = db.merkle().scan_leaves(tree, cursor, REPARTITION_CAP)?;
        let mut unconfirmed = 0;

        for (_, entries) in chunk.leaves {
            for entry in entries {
                let part = ring.partition_of(entry.shard);
                if !ring.is_local(part) {
                    let Some(rec) = db.get(&entry.key, Some(entry.version))? else {
                        if !db.holds(&entry) {
                            db.merkle()
                                .del(&entry.key, tree, entry.shard, entry.version)?;
                        }
                        continue;
                    };
                    let req = DistRequest::migration(db.name(), record_to_datum(&entry.key, rec));
                    let reports = distributor.distribute_and_wait(ring, part, &req).await;
                    if reports.iter().any(|r| r.confirmed > 0) {
                        db.remove(&entry.key, entry.version)?;
                        // remove() resolves the tree from the new layout
                        if ring.tree_id(part) != tree {
                            db.merkle()
                                .del(&entry.key, tree, entry.shard, entry.version)?;
                        }
                        ringkv_metrics::metrics().repart_moved.inc();
                    } else {
                        unconfirmed += 1;
                    }
                } else {
                    let new_tree = ring.tree_id(part);
                    if new_tree != tree {
                        db.merkle()
                            .add(&entry.key, new_tree, entry.shard, entry.version)?;
                        db.merkle()
                            .del(&entry.key, tree, entry.shard, entry.version)?;
                        ringkv_metrics::metrics().repart_relocated.inc();
                    }
                }
            }
        }

        if unconfirmed > 0 {
            tracing::warn!(
                "database {}: {} keys of tree {:04X} found no new owner, will retry",
                db.name(),
                unconfirmed,
                tree
            );
            return Ok(Walk::Incomplete);
        }
        match chunk.next {
            Some(next) => {
                cursor = next;
                if let Some(slot) = slot {
                    ring.save_checkpoint("nver", slot, version)?;
                    ring.save_checkpoint("check", slot, cursor)?;
                }
                tokio::task::yield_now().await;
            }
            None => return Ok(Walk::Done),
        }
    }
}

/// The per-database repartitioner loop. After a stable or incomplete pass
/// it sleeps for `idle` or until the ring changes.
pub async fn repartition_loop<C: PeerClient>(
    db: Arc<Database>,
    distributor: Arc<Distributor<C>>,
    idle: Duration,
    token: CancellationToken,
) {
    loop {
        let outcome = match repartition_pass(&db, &distributor, &token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("database {}: repartition failed: {}", db.name(), e);
                PassOutcome::Incomplete
            }
        };
        if token.is_cancelled() {
            break;
        }
        if outcome == PassOutcome::Paused {
            continue;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = db.ring().changed() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
    tracing::debug!("database {}: repartitioner stopped", db.name());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
