//! Consistent-hash partition table and replica placement.
//!
//! A ring splits the 32-bit shard space into `2^bits` contiguous
//! partitions. Each partition lists, per datacenter, the servers that
//! replicate it. The table is rebuilt wholesale from a [`RingConf`] and
//! swapped in under a write lock once the repartitioner has paused.

use crate::registry::ServerRegistry;
use crate::ring_conf::RingConf;
use parking_lot::RwLock;
use rand::Rng;
use ringkv_common::ServerInfo;
use ringkv_storage::keystore::ns;
use ringkv_storage::{KeyStore, StorageError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

/// Ring bits are capped here; more partitions only slow everything down.
pub const MAX_BITS: u32 = 16;

/// Chance, as `1 / N`, that anti-entropy picks a remote-datacenter peer.
const FAR_PEER_ODDS: u32 = 8;

/// Servers replicating one partition within one datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcServers {
    pub datacenter: String,
    pub servers: Vec<String>,
    /// Has explicit assignments in this slot (as opposed to interpolated).
    pub boundary: bool,
}

impl DcServers {
    fn new(datacenter: &str) -> Self {
        Self {
            datacenter: datacenter.to_string(),
            servers: Vec::new(),
            boundary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub shard_start: u32,
    pub is_local: bool,
    /// The local datacenter is always first.
    pub dcs: Vec<DcServers>,
    /// Ring version this partition was last repartitioned for.
    pub stable_version: u64,
}

impl Partition {
    fn new(index: usize, bits: u32, local_dc: &str) -> Self {
        Self {
            index,
            shard_start: ((index as u64) << (32 - bits)) as u32,
            is_local: false,
            dcs: vec![DcServers::new(local_dc)],
            stable_version: 0,
        }
    }

    pub fn tree_id(&self) -> u16 {
        (self.shard_start >> 16) as u16
    }

    /// Every replica, datacenter by datacenter, without duplicates.
    pub fn servers(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for dc in &self.dcs {
            for s in &dc.servers {
                if !out.contains(s) {
                    out.push(s.clone());
                }
            }
        }
        out
    }
}

#[derive(Debug, Default)]
struct RingState {
    table: Option<Vec<Partition>>,
    /// The table replaced by the last reconfigure, until repartitioning
    /// completes.
    previous: Option<Vec<Partition>>,
    replicas: u32,
    bits: u32,
    version: u64,
    stable_version: u64,
}

pub struct Ring {
    name: String,
    registry: Arc<ServerRegistry>,
    store: Arc<dyn KeyStore>,
    state: RwLock<RingState>,
    /// Taken before `run` by anyone wanting the repartitioner's lock, so a
    /// pause request cannot be overtaken by the repartitioner re-locking.
    gate: Mutex<()>,
    run: Arc<Mutex<()>>,
    pause: AtomicBool,
    changed: Notify,
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.read();
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("version", &st.version)
            .field("stable_version", &st.stable_version)
            .field("bits", &st.bits)
            .field("replicas", &st.replicas)
            .finish_non_exhaustive()
    }
}

impl Ring {
    pub fn new(name: &str, registry: Arc<ServerRegistry>, store: Arc<dyn KeyStore>) -> Self {
        Self {
            name: name.to_string(),
            registry,
            store,
            state: RwLock::new(RingState::default()),
            gate: Mutex::new(()),
            run: Arc::new(Mutex::new(())),
            pause: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// The last partition whose start is at or below `shard`; 0 without a
    /// partition table.
    pub fn partition_of(&self, shard: u32) -> usize {
        let st = self.state.read();
        match &st.table {
            Some(t) => t.partition_point(|p| p.shard_start <= shard).saturating_sub(1),
            None => 0,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.state.read().table.as_ref().map_or(1, Vec::len)
    }

    /// Everything is local when replication is off.
    pub fn is_local(&self, part: usize) -> bool {
        let st = self.state.read();
        match &st.table {
            Some(t) if st.replicas > 0 => t.get(part).is_some_and(|p| p.is_local),
            _ => true,
        }
    }

    pub fn tree_id(&self, part: usize) -> u16 {
        self.state
            .read()
            .table
            .as_ref()
            .and_then(|t| t.get(part))
            .map_or(0, Partition::tree_id)
    }

    pub fn partition(&self, part: usize) -> Option<Partition> {
        self.state.read().table.as_ref()?.get(part).cloned()
    }

    /// Replicas of `part`, or `None` when the ring is unpartitioned.
    pub fn replica_set(&self, part: usize) -> Option<Vec<String>> {
        self.state
            .read()
            .table
            .as_ref()
            .map(|t| t.get(part).map(Partition::servers).unwrap_or_default())
    }

    pub fn is_partitioned(&self) -> bool {
        self.state.read().table.is_some()
    }

    /// Repartitioning for the current version has completed.
    pub fn is_stable(&self) -> bool {
        let st = self.state.read();
        st.table.is_none() || st.stable_version == st.version
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn stable_version(&self) -> u64 {
        self.state.read().stable_version
    }

    pub fn bits(&self) -> u32 {
        self.state.read().bits
    }

    pub fn replicas(&self) -> u32 {
        self.state.read().replicas
    }

    /// Pick a peer to compare or fetch `part` against.
    ///
    /// Candidates are the up replicas of the partition (every known server
    /// when unpartitioned). Up-to-date peers win over stale ones; among
    /// those, a same-datacenter peer is chosen except for a 1 in 8 chance
    /// of going remote.
    pub fn random_peer(&self, part: usize, exclude: Option<&str>) -> Option<ServerInfo> {
        let (candidates, fallback) = {
            let st = self.state.read();
            match &st.table {
                None => (
                    self.registry.all().into_iter().map(|s| s.id).collect(),
                    Vec::new(),
                ),
                Some(t) => {
                    let current = t.get(part).map(Partition::servers).unwrap_or_default();
                    let before = match (&st.previous, t.get(part)) {
                        (Some(prev), Some(p)) => {
                            let i = prev
                                .partition_point(|q| q.shard_start <= p.shard_start)
                                .saturating_sub(1);
                            prev.get(i).map(Partition::servers).unwrap_or_default()
                        }
                        _ => Vec::new(),
                    };
                    (current, before)
                }
            }
        };
        self.pick_peer(&candidates, exclude)
            .or_else(|| self.pick_peer(&fallback, exclude))
    }

    fn pick_peer(&self, candidates: &[String], exclude: Option<&str>) -> Option<ServerInfo> {
        let local_dc = self.registry.local().datacenter;
        let mut rng = rand::thread_rng();

        // one reservoir per pool: (seen, chosen)
        let mut near: (u32, Option<ServerInfo>) = (0, None);
        let mut far: (u32, Option<ServerInfo>) = (0, None);
        let mut stale: (u32, Option<ServerInfo>) = (0, None);

        for id in candidates {
            if self.registry.is_local(id) || exclude == Some(id.as_str()) {
                continue;
            }
            let Some(info) = self.registry.get(id) else {
                continue;
            };
            if !info.is_up() {
                continue;
            }
            let pool = if !info.uptodate {
                &mut stale
            } else if info.datacenter == local_dc {
                &mut near
            } else {
                &mut far
            };
            pool.0 += 1;
            if rng.gen_range(0..pool.0) == 0 {
                pool.1 = Some(info);
            }
        }

        if far.1.is_some() && (near.1.is_none() || rng.gen_range(0..FAR_PEER_ODDS) == 0) {
            return far.1;
        }
        near.1.or(stale.1)
    }

    // -----------------------------------------------------------------------
    // Reconfiguration
    // -----------------------------------------------------------------------

    /// Install the table described by `conf` if it is newer than the
    /// current one. Blocks until the repartitioner has paused.
    pub async fn reconfigure(&self, conf: &RingConf) -> Result<bool, StorageError> {
        if conf.version <= self.version() {
            return Ok(false);
        }
        for s in &conf.servers {
            self.registry.ensure(&s.id, &s.datacenter, &s.rack);
        }

        let bits = conf.ring_bits.min(MAX_BITS);
        let replicas = conf.replicas;
        if replicas == 0 && self.replicas() == 0 {
            let mut st = self.state.write();
            st.version = conf.version;
            st.stable_version = conf.version;
            drop(st);
            self.registry
                .set_config_version(self.registry.local_id(), conf.version);
            return Ok(true);
        }

        let mut table = if replicas > 0 {
            let local = self.registry.local();
            let mut t = build_table(conf, bits, &local.id, &local.datacenter);
            for p in &mut t {
                p.stable_version = self.load_checkpoint("ver", p.index)?;
            }
            Some(t)
        } else {
            None
        };

        // ask the repartitioner to stop and wait until it has
        let gate = self.gate.lock().await;
        self.pause.store(true, Ordering::SeqCst);
        let run = self.run.lock().await;
        drop(gate);
        self.pause.store(false, Ordering::SeqCst);

        let (old_table, old_version) = {
            let st = self.state.read();
            (st.table.clone(), st.version)
        };
        if conf.version <= old_version {
            return Ok(false);
        }
        self.repartition_init(old_table.as_deref(), table.as_deref_mut(), old_version, conf.version)?;

        {
            let mut st = self.state.write();
            st.previous = st.table.take();
            st.table = table;
            st.replicas = replicas;
            st.bits = bits;
            st.version = conf.version;
            if st.table.is_none() {
                st.stable_version = conf.version;
                st.previous = None;
            }
        }
        drop(run);

        self.registry
            .set_config_version(self.registry.local_id(), conf.version);
        ringkv_metrics::metrics().reconfigures.inc();
        tracing::info!(
            "database {} reconfigured: version {}, {} partitions, {} replicas",
            self.name,
            conf.version,
            self.num_partitions(),
            replicas
        );
        self.changed.notify_one();
        Ok(true)
    }

    /// Mark partitions whose ownership did not move as already done, and
    /// wipe the checkpoints of everything else.
    fn repartition_init(
        &self,
        old: Option<&[Partition]>,
        new: Option<&mut [Partition]>,
        old_version: u64,
        new_version: u64,
    ) -> Result<(), StorageError> {
        let old = old.unwrap_or(&[]);
        match new {
            Some(new) if new.len() == old.len() => {
                for (p, o) in new.iter_mut().zip(old) {
                    if p.is_local != o.is_local {
                        continue;
                    }
                    if p.stable_version == old_version {
                        self.write_partition_done(p.index, new_version)?;
                        p.stable_version = new_version;
                    } else {
                        self.partition_clean(p.index)?;
                    }
                }
            }
            _ => {
                for o in old {
                    self.partition_clean(o.index)?;
                }
            }
        }
        Ok(())
    }

    /// Take the repartitioner's run lock.
    pub async fn acquire_run(&self) -> OwnedMutexGuard<()> {
        let _gate = self.gate.lock().await;
        self.run.clone().lock_owned().await
    }

    /// A reconfigure is waiting for the run lock.
    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Resolves after the next table swap.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    // -----------------------------------------------------------------------
    // Repartition checkpoints
    // -----------------------------------------------------------------------

    fn checkpoint_key(tag: &str, slot: usize) -> String {
        format!("{}:{:X}", tag, slot)
    }

    /// A stored checkpoint, 0 when absent or malformed.
    pub fn load_checkpoint(&self, tag: &str, slot: usize) -> Result<u64, StorageError> {
        let key = Self::checkpoint_key(tag, slot);
        Ok(match self.store.get(ns::PARTITION, key.as_bytes())? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                u64::from_be_bytes(buf)
            }
            _ => 0,
        })
    }

    pub fn save_checkpoint(&self, tag: &str, slot: usize, value: u64) -> Result<(), StorageError> {
        let key = Self::checkpoint_key(tag, slot);
        self.store
            .put(ns::PARTITION, key.as_bytes(), &value.to_be_bytes())
    }

    fn clear_checkpoint(&self, tag: &str, slot: usize) -> Result<(), StorageError> {
        let key = Self::checkpoint_key(tag, slot);
        self.store.delete(ns::PARTITION, key.as_bytes())
    }

    fn write_partition_done(&self, slot: usize, version: u64) -> Result<(), StorageError> {
        self.save_checkpoint("ver", slot, version)?;
        self.clear_checkpoint("nver", slot)?;
        self.clear_checkpoint("check", slot)
    }

    fn partition_clean(&self, slot: usize) -> Result<(), StorageError> {
        self.clear_checkpoint("ver", slot)?;
        self.clear_checkpoint("nver", slot)?;
        self.clear_checkpoint("check", slot)
    }

    /// Record that partition `slot` is repartitioned for `version`.
    pub fn partition_done(&self, slot: usize, version: u64) -> Result<(), StorageError> {
        self.write_partition_done(slot, version)?;
        let mut st = self.state.write();
        if let Some(p) = st.table.as_mut().and_then(|t| t.get_mut(slot)) {
            p.stable_version = version;
        }
        Ok(())
    }

    /// Stable version of partition `slot`, if it exists in the current table.
    pub fn partition_stable_version(&self, slot: usize) -> Option<u64> {
        self.state
            .read()
            .table
            .as_ref()?
            .get(slot)
            .map(|p| p.stable_version)
    }

    /// Every partition is done for `version`: persist the bits the data is
    /// now laid out for and drop the previous table.
    pub fn mark_stable(&self, version: u64) -> Result<(), StorageError> {
        let bits = self.bits();
        self.save_checkpoint("bits", 0, bits as u64)?;
        let mut st = self.state.write();
        if st.version != version || st.stable_version == version {
            return Ok(());
        }
        st.stable_version = version;
        st.previous = None;
        drop(st);
        tracing::info!("database {} partitions are now stable", self.name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Table construction
// ---------------------------------------------------------------------------

/// Build a partition table: explicit assignments first, then replicas
/// topped up (rack-diverse where possible), then empty slots copied from
/// the nearest assigned slot before them.
pub fn build_table(conf: &RingConf, bits: u32, local_id: &str, local_dc: &str) -> Vec<Partition> {
    let bits = bits.min(MAX_BITS);
    let size = 1usize << bits;
    let mut table: Vec<Partition> = (0..size).map(|i| Partition::new(i, bits, local_dc)).collect();

    let racks: HashMap<&str, &str> = conf
        .servers
        .iter()
        .map(|s| (s.id.as_str(), s.rack.as_str()))
        .collect();

    for server in &conf.servers {
        for &shard in &server.shards {
            insert_assignment(&mut table, bits, &server.id, &server.datacenter, shard);
        }
    }
    add_replicas(&mut table, conf.replicas as usize, &racks);
    interpolate(&mut table);

    for p in &mut table {
        p.is_local = p.dcs.iter().any(|dc| dc.servers.iter().any(|s| s == local_id));
    }
    table
}

fn insert_assignment(table: &mut [Partition], bits: u32, server: &str, datacenter: &str, shard: u32) {
    let slot = if bits == 0 {
        0
    } else {
        (shard >> (32 - bits)) as usize
    };
    let d = match table[slot].dcs.iter().position(|dc| dc.datacenter == datacenter) {
        Some(d) => d,
        None => {
            // a new datacenter appears in every partition, at the same index
            for p in table.iter_mut() {
                p.dcs.push(DcServers::new(datacenter));
            }
            table[slot].dcs.len() - 1
        }
    };
    let dc = &mut table[slot].dcs[d];
    dc.servers.push(server.to_string());
    dc.boundary = true;
}

fn add_replicas(table: &mut [Partition], replicas: usize, racks: &HashMap<&str, &str>) {
    let mut start = 0;
    for i in 0..table.len() {
        for d in 0..table[i].dcs.len() {
            if !table[i].dcs[d].boundary {
                continue;
            }
            start = add_replicas_for(table, replicas, i, start, d, true, racks);
            start = add_replicas_for(table, replicas, i, start, d, false, racks);
        }
    }
}

/// Walk forward from `start` over slots with explicit assignments, adding
/// their first server to partition `pn` until it has `replicas`. Returns
/// where the next search should begin.
fn add_replicas_for(
    table: &mut [Partition],
    replicas: usize,
    pn: usize,
    start: usize,
    d: usize,
    tryrack: bool,
    racks: &HashMap<&str, &str>,
) -> usize {
    if table[pn].dcs[d].servers.len() >= replicas {
        return start;
    }
    let size = table.len();
    for k in 0..size {
        let pos = (start + k + 1) % size;
        let candidate = match table[pos].dcs.get(d) {
            Some(dc) if dc.boundary => match dc.servers.first() {
                Some(s) => s.clone(),
                None => continue,
            },
            _ => continue,
        };
        let here = &table[pn].dcs[d].servers;
        let rack = racks.get(candidate.as_str());
        let compatible = here.iter().all(|s| {
            s != &candidate && !(tryrack && racks.get(s.as_str()) == rack)
        });
        if compatible {
            let dc = &mut table[pn].dcs[d];
            dc.servers.push(candidate);
            if dc.servers.len() >= replicas {
                return pos;
            }
        }
    }
    start
}

fn interpolate(table: &mut [Partition]) {
    let size = table.len();
    for i in 0..size {
        for d in 0..table[i].dcs.len() {
            if table[i].dcs[d].boundary {
                continue;
            }
            let found = (0..size).find_map(|j| {
                let pos = (i + size - j) % size;
                let src = &table[pos].dcs[d];
                (!src.servers.is_empty()).then(|| src.servers.clone())
            });
            if let Some(servers) = found {
                table[i].dcs[d].servers = servers;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_conf::ServerShards;
    use ringkv_storage::MemoryStore;
    use std::time::Duration;

    fn server(id: &str, dc: &str, rack: &str, shards: &[u32]) -> ServerShards {
        ServerShards {
            id: id.into(),
            datacenter: dc.into(),
            rack: rack.into(),
            shards: shards.to_vec(),
        }
    }

    fn conf(version: u64, replicas: u32, bits: u32, servers: Vec<ServerShards>) -> RingConf {
        RingConf {
            version,
            replicas,
            ring_bits: bits,
            servers,
        }
    }

    fn ring(local: &str) -> Ring {
        let registry = Arc::new(ServerRegistry::new(ServerInfo::new(local, "east", "r1", "")));
        Ring::new("test", registry, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_one_bit_split() {
        let c = conf(1, 1, 1, vec![server("a", "east", "r1", &[0, 0x8000_0000])]);
        let table = build_table(&c, 1, "a", "east");
        assert_eq!(table.len(), 2);
        assert_eq!(table[1].shard_start, 0x8000_0000);
    }

    #[tokio::test]
    async fn test_partition_of_one_bit() {
        let r = ring("a");
        assert_eq!(r.partition_of(0xDEAD_BEEF), 0);
        assert!(r.is_local(0));

        let c = conf(1, 1, 1, vec![server("a", "east", "r1", &[0, 0x8000_0000])]);
        assert!(r.reconfigure(&c).await.unwrap());
        assert_eq!(r.partition_of(0x0000_0000), 0);
        assert_eq!(r.partition_of(0x7FFF_FFFF), 0);
        assert_eq!(r.partition_of(0x8000_0000), 1);
        assert_eq!(r.partition_of(0x8000_0001), 1);
        assert_eq!(r.partition_of(u32::MAX), 1);
    }

    #[test]
    fn test_partitions_tile_the_shard_space() {
        let c = conf(1, 1, 4, vec![server("a", "east", "r1", &[0])]);
        let table = build_table(&c, 4, "a", "east");
        assert_eq!(table.len(), 16);
        let mut trees: Vec<u16> = table.iter().map(Partition::tree_id).collect();
        trees.dedup();
        assert_eq!(trees.len(), 16);
        for (i, p) in table.iter().enumerate() {
            assert_eq!(p.shard_start as u64, (i as u64) << 28);
            let end = if i + 1 < table.len() { table[i + 1].shard_start } else { 0 };
            assert!(i + 1 == table.len() || end > p.shard_start);
        }
    }

    #[test]
    fn test_interpolation_copies_preceding_slot() {
        let c = conf(
            1,
            1,
            2,
            vec![
                server("a", "east", "r1", &[0x4000_0000]),
                server("b", "east", "r2", &[0xC000_0000]),
            ],
        );
        let table = build_table(&c, 2, "a", "east");
        assert_eq!(table[1].servers(), vec!["a"]);
        assert_eq!(table[2].servers(), vec!["a"]);
        assert_eq!(table[3].servers(), vec!["b"]);
        // slot 0 wraps around to the last assignment
        assert_eq!(table[0].servers(), vec!["b"]);
        assert!(table[1].is_local && table[2].is_local);
        assert!(!table[0].is_local && !table[3].is_local);
    }

    #[test]
    fn test_replicas_prefer_other_racks() {
        let c = conf(
            1,
            2,
            2,
            vec![
                server("a", "east", "r1", &[0]),
                server("b", "east", "r1", &[0x4000_0000]),
                server("c", "east", "r2", &[0x8000_0000]),
            ],
        );
        let table = build_table(&c, 2, "a", "east");
        // b shares a's rack, so a's slot skips it for c
        assert_eq!(table[0].servers(), vec!["a", "c"]);
        assert_eq!(table[1].servers().len(), 2);
        assert!(table[1].servers().contains(&"c".to_string()));
    }

    #[test]
    fn test_replicas_fall_back_when_racks_run_out() {
        let c = conf(
            1,
            2,
            1,
            vec![
                server("a", "east", "r1", &[0]),
                server("b", "east", "r1", &[0x8000_0000]),
            ],
        );
        let table = build_table(&c, 1, "a", "east");
        assert_eq!(table[0].servers(), vec!["a", "b"]);
        assert_eq!(table[1].servers(), vec!["b", "a"]);
    }

    #[test]
    fn test_new_datacenter_added_everywhere() {
        let c = conf(
            1,
            1,
            1,
            vec![
                server("a", "east", "r1", &[0]),
                server("w", "west", "r1", &[0x8000_0000]),
            ],
        );
        let table = build_table(&c, 1, "a", "east");
        for p in &table {
            let names: Vec<&str> = p.dcs.iter().map(|d| d.datacenter.as_str()).collect();
            assert_eq!(names, vec!["east", "west"]);
        }
        // every partition has a replica in both datacenters
        assert_eq!(table[0].servers(), vec!["a", "w"]);
        assert_eq!(table[1].servers(), vec!["a", "w"]);
    }

    #[tokio::test]
    async fn test_random_peer_preferences() {
        let r = ring("a");
        let c = conf(
            1,
            3,
            0,
            vec![
                server("a", "east", "r1", &[0]),
                server("b", "east", "r2", &[0]),
                server("c", "east", "r3", &[0]),
            ],
        );
        r.reconfigure(&c).await.unwrap();
        assert!(r.random_peer(0, None).is_none(), "peers start down");

        r.registry().set_status("b", true, false);
        assert_eq!(r.random_peer(0, None).unwrap().id, "b");

        r.registry().set_status("c", true, true);
        for _ in 0..20 {
            assert_eq!(r.random_peer(0, None).unwrap().id, "c");
        }
        assert_eq!(r.random_peer(0, Some("c")).unwrap().id, "b");
    }

    #[test]
    fn test_random_peer_goes_remote_one_time_in_eight() {
        let r = ring("a");
        r.registry().upsert(ServerInfo::new("b", "east", "r2", ""));
        r.registry().upsert(ServerInfo::new("c", "west", "r1", ""));
        r.registry().set_status("b", true, true);
        r.registry().set_status("c", true, true);

        const TRIALS: u32 = 8000;
        let far = (0..TRIALS)
            .filter(|_| r.random_peer(0, None).unwrap().id == "c")
            .count() as u32;
        // expected 1000, sigma about 30
        assert!((800..=1200).contains(&far), "remote picked {} of {} times", far, TRIALS);

        // with no nearby candidate the remote one always wins
        r.registry().set_status("b", false, false);
        for _ in 0..50 {
            assert_eq!(r.random_peer(0, None).unwrap().id, "c");
        }
    }

    #[tokio::test]
    async fn test_reconfigure_ignores_older_versions() {
        let r = ring("a");
        let c = conf(10, 1, 2, vec![server("a", "east", "r1", &[0])]);
        assert!(r.reconfigure(&c).await.unwrap());
        assert_eq!(r.version(), 10);
        assert!(!r.is_stable());
        assert!(!r.reconfigure(&conf(5, 1, 3, vec![])).await.unwrap());
        assert_eq!(r.bits(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_partitions_are_marked_done() {
        let r = ring("a");
        let c1 = conf(10, 1, 1, vec![server("a", "east", "r1", &[0]), server("b", "east", "r2", &[0x8000_0000])]);
        r.reconfigure(&c1).await.unwrap();
        r.partition_done(0, 10).unwrap();
        r.partition_done(1, 10).unwrap();
        r.mark_stable(10).unwrap();
        assert!(r.is_stable());

        // same layout, new version: nothing has to move
        let mut c2 = c1.clone();
        c2.version = 20;
        r.reconfigure(&c2).await.unwrap();
        assert_eq!(r.partition_stable_version(0), Some(20));
        assert_eq!(r.load_checkpoint("ver", 1).unwrap(), 20);
        assert!(!r.is_stable());
    }

    #[tokio::test]
    async fn test_reconfigure_waits_for_repartitioner() {
        let r = Arc::new(ring("a"));
        let guard = r.acquire_run().await;

        let r2 = r.clone();
        let task = tokio::spawn(async move {
            let c = conf(1, 1, 1, vec![server("a", "east", "r1", &[0])]);
            r2.reconfigure(&c).await.unwrap()
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !r.pause_requested() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(r.version(), 0);

        drop(guard);
        assert!(task.await.unwrap());
        assert_eq!(r.version(), 1);
        assert!(!r.pause_requested());
    }

    #[tokio::test]
    async fn test_unpartitioned_reconfigure() {
        let r = ring("a");
        assert!(r.reconfigure(&conf(3, 0, 0, vec![])).await.unwrap());
        assert!(r.is_stable());
        assert_eq!(r.version(), 3);
        assert_eq!(r.num_partitions(), 1);
        assert!(r.replica_set(0).is_none());
    }
}
