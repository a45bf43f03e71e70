//! Operator commands for ringkv rings.
//!
//! Every command is a read-modify-write of one database's [`RingConf`] in
//! `_conf`: the record is read (or seeded from the node's database
//! configuration), changed, stamped with the current time as its version
//! and written back through [`Store::put_ring_conf`], which replicates it
//! like any other write. Nodes pick the new layout up from their ring
//! maintenance loop.
//!
//! | command | effect |
//! |---------|--------|
//! | `init` | seed the record from the configured replicas and bits |
//! | `set_bits` | partition table size, 1..=16 bits |
//! | `set_replicas` | replicas per partition, 0 turns partitioning off |
//! | `add_node` | give a server a shard, growing the table if it gets crowded |
//! | `add_slots` | give a server `n` random shards |
//! | `remove_node` | drop a server and all its shards |

use rand::Rng;
use ringkv_common::{now_micros, PutStatus};
use ringkv_kv::ring_conf::{RingConf, ServerShards};
use ringkv_kv::{PeerClient, Store, StoreError};
use std::sync::Arc;

/// Smallest table `init` creates.
pub const MIN_INIT_BITS: u32 = 4;
pub const MAX_BITS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database {0} is not configured for replicas")]
    NotConfigured(String),
    #[error("no ring configuration for database {0}")]
    NoRingConf(String),
    #[error("unknown server: {0}")]
    UnknownServer(String),
    #[error("ring configuration for {database} not written: {status}")]
    VersionConflict { database: String, status: PutStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ring configuration commands against one node's [`Store`].
pub struct RingAdmin<C: PeerClient> {
    store: Arc<Store<C>>,
}

impl<C: PeerClient> std::fmt::Debug for RingAdmin<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingAdmin").finish_non_exhaustive()
    }
}

impl<C: PeerClient> RingAdmin<C> {
    pub fn new(store: Arc<Store<C>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store<C>> {
        &self.store
    }

    /// Write a fresh configuration built from the node's settings for
    /// `database`, replacing whatever is stored.
    pub async fn init(&self, database: &str) -> Result<RingConf, AdminError> {
        let conf = self.initial_conf(database)?;
        self.write(database, conf).await
    }

    pub async fn set_bits(&self, database: &str, bits: u32) -> Result<RingConf, AdminError> {
        if !(1..=MAX_BITS).contains(&bits) {
            return Err(AdminError::InvalidArgument(format!(
                "ring bits must be 1..={}, got {}",
                MAX_BITS, bits
            )));
        }
        let mut conf = self.current_or_initial(database)?;
        conf.ring_bits = bits;
        self.write(database, conf).await
    }

    pub async fn set_replicas(&self, database: &str, replicas: u32) -> Result<RingConf, AdminError> {
        let mut conf = self.current_or_initial(database)?;
        conf.replicas = replicas;
        self.write(database, conf).await
    }

    /// Assign `shard` to `server`. The table grows to
    /// `ceil(log2(shards * 4))` bits once `2^bits <= shards * 4`.
    pub async fn add_node(&self, database: &str, server: &str, shard: u32) -> Result<RingConf, AdminError> {
        let mut conf = self.current_or_initial(database)?;
        self.assign(&mut conf, server, &[shard])?;
        self.write(database, conf).await
    }

    /// Assign `count` random shards to `server`.
    pub async fn add_slots(&self, database: &str, server: &str, count: u32) -> Result<RingConf, AdminError> {
        if count == 0 {
            return Err(AdminError::InvalidArgument("slot count must be > 0".into()));
        }
        let shards: Vec<u32> = {
            let mut rng = rand::thread_rng();
            (0..count).map(|_| rng.gen::<u32>()).collect()
        };
        let mut conf = self.current_or_initial(database)?;
        self.assign(&mut conf, server, &shards)?;
        self.write(database, conf).await
    }

    /// Remove `server` and its shards. Needs an existing configuration.
    pub async fn remove_node(&self, database: &str, server: &str) -> Result<RingConf, AdminError> {
        let mut conf = self
            .store
            .ring_conf(database)?
            .ok_or_else(|| AdminError::NoRingConf(database.to_string()))?;
        conf.servers.retain(|s| s.id != server);
        tracing::info!(
            "remove {} from ring {}: {} bits, {} shards",
            server,
            database,
            conf.ring_bits,
            conf.shard_count()
        );
        self.write(database, conf).await
    }

    fn assign(&self, conf: &mut RingConf, server: &str, shards: &[u32]) -> Result<(), AdminError> {
        let info = self
            .store
            .registry()
            .get(server)
            .ok_or_else(|| AdminError::UnknownServer(server.to_string()))?;
        if conf.server(server).is_none() {
            conf.servers.push(ServerShards {
                id: info.id.clone(),
                datacenter: info.datacenter.clone(),
                rack: info.rack.clone(),
                shards: Vec::new(),
            });
        }
        if let Some(entry) = conf.server_mut(server) {
            entry.shards.extend_from_slice(shards);
        }

        let crowd = conf.shard_count() as u64 * 4;
        if (1u64 << conf.ring_bits) <= crowd {
            conf.ring_bits = ceil_log2(crowd).min(MAX_BITS);
        }
        tracing::info!(
            "add {} to ring: {} bits, {} shards",
            server,
            conf.ring_bits,
            conf.shard_count()
        );
        Ok(())
    }

    fn initial_conf(&self, database: &str) -> Result<RingConf, AdminError> {
        // the database must be hosted here
        self.store.database(database)?;
        let dbc = self
            .store
            .config()
            .databases
            .iter()
            .find(|d| d.name == database)
            .ok_or_else(|| AdminError::NotConfigured(database.to_string()))?;
        if dbc.replicas == 0 {
            return Err(AdminError::NotConfigured(database.to_string()));
        }
        Ok(RingConf {
            version: 0,
            replicas: dbc.replicas,
            ring_bits: dbc.ring_bits.clamp(MIN_INIT_BITS, MAX_BITS),
            servers: Vec::new(),
        })
    }

    fn current_or_initial(&self, database: &str) -> Result<RingConf, AdminError> {
        match self.store.ring_conf(database)? {
            Some(conf) => Ok(conf),
            None => self.initial_conf(database),
        }
    }

    async fn write(&self, database: &str, mut conf: RingConf) -> Result<RingConf, AdminError> {
        conf.version = now_micros().max(conf.version + 1);
        let status = self.store.put_ring_conf(database, &conf).await?;
        if status != PutStatus::Done {
            return Err(AdminError::VersionConflict {
                database: database.to_string(),
                status,
            });
        }
        Ok(conf)
    }
}

/// Smallest `b` with `2^b >= n`.
fn ceil_log2(n: u64) -> u32 {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_kv::local::{LocalNetwork, LocalPeerClient};
    use ringkv_storage::BackendRegistry;

    fn admin(replicas: u32, bits: u32) -> RingAdmin<LocalPeerClient> {
        let yaml = format!(
            r#"
server_id: a
listen: "127.0.0.1:7000"
storage:
  backend: memory
databases:
  - name: users
    replicas: {}
    ring_bits: {}
  - name: cache
peers:
  - id: b
    address: "127.0.0.1:7001"
    datacenter: west
    rack: r2
"#,
            replicas, bits
        );
        let config = ringkv_config::load_from_str(&yaml).unwrap();
        let network = LocalNetwork::new();
        let store = Store::open(&config, &BackendRegistry::new(), Arc::new(network.client())).unwrap();
        RingAdmin::new(Arc::new(store))
    }

    #[test]
    fn test_ceil_log2() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(16), 4);
        assert_eq!(ceil_log2(17), 5);
    }

    #[tokio::test]
    async fn test_init_uses_configured_values_with_minimum_bits() {
        let admin = admin(3, 2);
        let conf = admin.init("users").await.unwrap();
        assert_eq!(conf.replicas, 3);
        assert_eq!(conf.ring_bits, MIN_INIT_BITS);
        assert!(conf.version > 0);
        assert_eq!(admin.store().ring_conf("users").unwrap(), Some(conf));
    }

    #[tokio::test]
    async fn test_init_needs_replicas() {
        let admin = admin(3, 8);
        assert!(matches!(
            admin.init("cache").await,
            Err(AdminError::NotConfigured(_))
        ));
        assert!(matches!(
            admin.init("nope").await,
            Err(AdminError::Store(StoreError::UnknownDatabase(_)))
        ));
    }

    #[tokio::test]
    async fn test_set_bits_validates_range() {
        let admin = admin(2, 4);
        assert!(matches!(
            admin.set_bits("users", 0).await,
            Err(AdminError::InvalidArgument(_))
        ));
        assert!(matches!(
            admin.set_bits("users", 17).await,
            Err(AdminError::InvalidArgument(_))
        ));
        let conf = admin.set_bits("users", 10).await.unwrap();
        assert_eq!(conf.ring_bits, 10);
        assert_eq!(conf.replicas, 2);
    }

    #[tokio::test]
    async fn test_set_replicas_keeps_servers() {
        let admin = admin(2, 4);
        admin.add_node("users", "a", 0).await.unwrap();
        let conf = admin.set_replicas("users", 0).await.unwrap();
        assert_eq!(conf.replicas, 0);
        assert_eq!(conf.servers.len(), 1);
    }

    #[tokio::test]
    async fn test_add_node_records_placement_and_grows_bits() {
        let admin = admin(2, 4);
        admin.add_node("users", "a", 0).await.unwrap();
        admin.add_node("users", "b", 0x4000_0000).await.unwrap();
        admin.add_node("users", "b", 0x8000_0000).await.unwrap();
        // 4 shards * 4 = 16 >= 2^4: ceil(log2(16)) is still 4
        let conf = admin.add_node("users", "a", 0xC000_0000).await.unwrap();
        assert_eq!(conf.ring_bits, 4);
        // 5 * 4 = 20 -> 5 bits
        let conf = admin.add_node("users", "a", 0x2000_0000).await.unwrap();
        assert_eq!(conf.ring_bits, 5);

        let b = conf.server("b").unwrap();
        assert_eq!(b.datacenter, "west");
        assert_eq!(b.rack, "r2");
        assert_eq!(b.shards, vec![0x4000_0000, 0x8000_0000]);
        assert_eq!(conf.shard_count(), 5);
    }

    #[tokio::test]
    async fn test_add_unknown_server_fails() {
        let admin = admin(2, 4);
        assert!(matches!(
            admin.add_node("users", "zz", 0).await,
            Err(AdminError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn test_add_slots() {
        let admin = admin(2, 4);
        let conf = admin.add_slots("users", "b", 8).await.unwrap();
        assert_eq!(conf.server("b").unwrap().shards.len(), 8);
        // 8 * 4 = 32 -> 5 bits
        assert_eq!(conf.ring_bits, 5);
    }

    #[tokio::test]
    async fn test_remove_node() {
        let admin = admin(2, 4);
        assert!(matches!(
            admin.remove_node("users", "b").await,
            Err(AdminError::NoRingConf(_))
        ));
        admin.add_node("users", "a", 0).await.unwrap();
        admin.add_node("users", "b", 0x8000_0000).await.unwrap();
        let conf = admin.remove_node("users", "b").await.unwrap();
        assert!(conf.server("b").is_none());
        assert_eq!(conf.shard_count(), 1);
    }

    #[tokio::test]
    async fn test_each_write_is_newer() {
        let admin = admin(2, 4);
        let first = admin.init("users").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = admin.set_replicas("users", 3).await.unwrap();
        assert!(second.version > first.version);
        assert_eq!(admin.store().ring_conf("users").unwrap().unwrap().replicas, 3);
    }
}
