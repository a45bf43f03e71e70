//! One node: its databases, the `_conf` ring configurations and the
//! background work that keeps them in shape.
//!
//! [`Store`] answers peer requests ([`PeerHandler`]) and client requests,
//! and owns the maintenance tasks: Merkle flushing, expiry, ring
//! reconfiguration, peer probing, anti-entropy and repartitioning.

use crate::anti_entropy::AntiEntropy;
use crate::database::{record_to_datum, Database, DbError};
use crate::distrib::{DistRequest, Distributor, TierReport};
use crate::merkle::CheckItem;
use crate::peer_client::{CheckRequest, PeerClient, PeerError, PeerHandler};
use crate::registry::ServerRegistry;
use crate::repartition::repartition_loop;
use crate::ring_conf::RingConf;
use ringkv_common::{now_micros, Datum, KeyVersion, PutStatus, ServerInfo};
use ringkv_config::{NodeConfig, CONF_DATABASE};
use ringkv_storage::wal::FsyncPolicy;
use ringkv_storage::{BackendRegistry, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown database: {0}")]
    UnknownDatabase(String),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("malformed ring configuration for {database}: {source}")]
    BadRingConf {
        database: String,
        source: serde_json::Error,
    },
}

impl From<StoreError> for PeerError {
    fn from(e: StoreError) -> Self {
        PeerError::RpcFailed(e.to_string())
    }
}

/// Outcome of a client write.
#[derive(Debug, Clone)]
pub struct PutReply {
    pub status: PutStatus,
    /// The version the write was stored under (assigned here when absent).
    pub version: u64,
    /// Per-tier replication results; empty unless waited for.
    pub reports: Vec<TierReport>,
}

impl PutReply {
    pub fn confirmed(&self) -> u32 {
        self.reports.iter().map(|r| r.confirmed).sum()
    }
}

pub struct Store<C: PeerClient> {
    registry: Arc<ServerRegistry>,
    client: Arc<C>,
    distributor: Arc<Distributor<C>>,
    anti_entropy: AntiEntropy<C>,
    /// Every hosted database, `_conf` included.
    databases: BTreeMap<String, Arc<Database>>,
    config: NodeConfig,
}

impl<C: PeerClient> std::fmt::Debug for Store<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("server", &self.registry.local_id())
            .field("databases", &self.databases.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<C: PeerClient> Store<C> {
    /// Open every configured database plus `_conf`, and seed the server
    /// registry from the configured peers.
    pub fn open(config: &NodeConfig, backends: &BackendRegistry, client: Arc<C>) -> Result<Self, StoreError> {
        let local = ServerInfo::new(
            config.server_id.clone(),
            config.datacenter.clone(),
            config.rack.clone(),
            config.listen.to_string(),
        );
        let registry = Arc::new(ServerRegistry::new(local));
        for p in &config.peers {
            registry.upsert(ServerInfo::new(
                p.id.clone(),
                p.datacenter.clone(),
                p.rack.clone(),
                p.address.clone(),
            ));
        }

        let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
        let mut databases = BTreeMap::new();
        let conf_store = backends.open(
            &config.storage.backend,
            &config.storage.data_dir.join(CONF_DATABASE),
            fsync,
        )?;
        databases.insert(
            CONF_DATABASE.to_string(),
            Arc::new(Database::new(CONF_DATABASE, conf_store, registry.clone())),
        );
        for dbc in &config.databases {
            let store = backends.open(
                config.backend_for(dbc),
                &config.storage.data_dir.join(&dbc.name),
                fsync,
            )?;
            let db = Database::new(&dbc.name, store, registry.clone()).with_default_ttl(dbc.expire_secs);
            databases.insert(dbc.name.clone(), Arc::new(db));
        }
        tracing::info!(
            "server {} opened {} databases",
            config.server_id,
            databases.len()
        );

        let distributor = Arc::new(Distributor::new(
            registry.clone(),
            client.clone(),
            config.distribute.clone(),
        ));
        Ok(Self {
            anti_entropy: AntiEntropy::new(client.clone(), config.anti_entropy.clone()),
            registry,
            client,
            distributor,
            databases,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn distributor(&self) -> &Arc<Distributor<C>> {
        &self.distributor
    }

    pub fn anti_entropy(&self) -> &AntiEntropy<C> {
        &self.anti_entropy
    }

    pub fn database(&self, name: &str) -> Result<&Arc<Database>, StoreError> {
        self.databases
            .get(name)
            .ok_or_else(|| StoreError::UnknownDatabase(name.to_string()))
    }

    /// Every hosted database, `_conf` included.
    pub fn databases(&self) -> impl Iterator<Item = &Arc<Database>> {
        self.databases.values()
    }

    // -----------------------------------------------------------------------
    // Client requests
    // -----------------------------------------------------------------------

    /// Write locally, then start replicating: the write leaves here as a
    /// first-hop DIST sent by this server.
    pub async fn put(&self, database: &str, datum: Datum) -> Result<PutStatus, StoreError> {
        Ok(self.write(database, datum, false).await?.status)
    }

    /// [`Self::put`], waiting for the first round of replication.
    pub async fn put_and_wait(&self, database: &str, datum: Datum) -> Result<PutReply, StoreError> {
        self.write(database, datum, true).await
    }

    /// A client write. A missing version is assigned by the database.
    pub async fn write(&self, database: &str, mut datum: Datum, wait: bool) -> Result<PutReply, StoreError> {
        let db = self.database(database)?;
        let status = db.put(&mut datum)?;
        let mut reply = PutReply {
            status,
            version: datum.version,
            reports: Vec::new(),
        };
        if status != PutStatus::Done {
            return Ok(reply);
        }
        let req = DistRequest {
            database: database.to_string(),
            hop: 0,
            deadline: 0,
            sender: Some(self.registry.local_id().to_string()),
            datum,
        };
        reply.reports = self.replicate(db, &req, wait).await;
        Ok(reply)
    }

    /// Tombstone `key`.
    pub async fn remove(&self, database: &str, key: &str) -> Result<PutStatus, StoreError> {
        let datum = Datum {
            key: key.to_string(),
            value: None,
            ..Default::default()
        };
        self.put(database, datum).await
    }

    /// The current value of `key`; deleted and expired keys read as `None`.
    pub fn get(&self, database: &str, key: &str) -> Result<Option<Datum>, StoreError> {
        let db = self.database(database)?;
        Ok(db
            .get(key, None)?
            .filter(|rec| !rec.is_tombstone())
            .map(|rec| record_to_datum(key, rec)))
    }

    async fn replicate(&self, db: &Database, req: &DistRequest, wait: bool) -> Vec<TierReport> {
        let shard = req.datum.shard.unwrap_or_else(|| ringkv_common::shard_hash(&req.datum.key));
        let ring = db.ring();
        let part = ring.partition_of(shard);
        if wait {
            self.distributor.distribute_and_wait(ring, part, req).await
        } else {
            self.distributor.distribute(ring, part, req);
            Vec::new()
        }
    }

    // -----------------------------------------------------------------------
    // Ring configuration
    // -----------------------------------------------------------------------

    /// The stored ring configuration of `database`, if any.
    pub fn ring_conf(&self, database: &str) -> Result<Option<RingConf>, StoreError> {
        let conf_db = self.database(CONF_DATABASE)?;
        let Some(rec) = conf_db.get(database, None)? else {
            return Ok(None);
        };
        if rec.is_tombstone() {
            return Ok(None);
        }
        RingConf::decode(&rec.payload)
            .map(Some)
            .map_err(|source| StoreError::BadRingConf {
                database: database.to_string(),
                source,
            })
    }

    /// Store `conf` for `database` in `_conf` at version `conf.version` and
    /// replicate it like any other write.
    pub async fn put_ring_conf(&self, database: &str, conf: &RingConf) -> Result<PutStatus, StoreError> {
        let datum = Datum::new(database, conf.encode()).with_version(conf.version);
        Ok(self.put_and_wait(CONF_DATABASE, datum).await?.status)
    }

    /// Apply stored ring configurations that are newer than the running
    /// ring and have settled. Returns how many rings changed.
    pub async fn maintain_rings(&self) -> Result<usize, StoreError> {
        let settle = self.config.ring.settle_secs.saturating_mul(1_000_000);
        let now = now_micros();
        let mut changed = 0;
        for (name, db) in &self.databases {
            if name == CONF_DATABASE {
                continue;
            }
            let conf = match self.ring_conf(name) {
                Ok(Some(conf)) => conf,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("{}", e);
                    continue;
                }
            };
            let ring = db.ring();
            if conf.version <= ring.version() {
                continue;
            }
            // a running ring waits for the change to settle; a fresh one
            // takes it at once
            if ring.version() != 0 && now.saturating_sub(conf.version) < settle {
                tracing::debug!("database {}: ring version {} not settled yet", name, conf.version);
                continue;
            }
            if ring.reconfigure(&conf).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Ask every known peer for its status and record the answer.
    pub async fn probe_peers(&self) {
        let timeout = Duration::from_millis(self.config.distribute.timeout_ms);
        for peer in self.registry.peers() {
            match tokio::time::timeout(timeout, self.client.status(&peer)).await {
                Ok(Ok(info)) => {
                    if !peer.is_up() {
                        tracing::info!("server {} is up", peer.id);
                    }
                    self.registry.set_status(&peer.id, true, info.uptodate);
                }
                Ok(Err(e)) => {
                    if peer.is_up() {
                        tracing::info!("server {} is down: {}", peer.id, e);
                    }
                    self.registry.set_status(&peer.id, false, false);
                }
                Err(_) => {
                    if peer.is_up() {
                        tracing::info!("server {} is down: probe timed out", peer.id);
                    }
                    self.registry.set_status(&peer.id, false, false);
                }
            }
        }
    }

    pub fn flush_merkle(&self, blocking: bool) -> usize {
        let mut applied = 0;
        for db in self.databases.values() {
            match db.flush_merkle(blocking) {
                Ok(n) => applied += n,
                Err(e) => tracing::warn!("database {}: merkle flush failed: {}", db.name(), e),
            }
        }
        applied
    }

    pub fn expire(&self, now: u64) -> usize {
        let mut removed = 0;
        for db in self.databases.values() {
            match db.expire(now) {
                Ok(n) => removed += n,
                Err(e) => tracing::warn!("database {}: expire failed: {}", db.name(), e),
            }
        }
        removed
    }

    /// One anti-entropy cycle over every database. Marks each database that
    /// converged as up to date, and this server once all of them are.
    pub async fn run_anti_entropy(&self, token: &CancellationToken) -> bool {
        let mut all_ok = true;
        for db in self.databases.values() {
            if token.is_cancelled() {
                return false;
            }
            if self.anti_entropy.run_database(db, token).await {
                if !db.is_uptodate() {
                    tracing::info!("database {} is up to date", db.name());
                }
                db.set_uptodate(true);
            } else {
                all_ok = false;
            }
        }
        if self.databases.values().all(|db| db.is_uptodate()) {
            self.registry.set_local_uptodate(true);
        }
        all_ok
    }

    /// Spawn every background loop onto `tracker`. They stop when `token`
    /// is cancelled; call [`Self::wind_down`] after the tracker drains.
    pub fn spawn_maintenance(self: &Arc<Self>, tracker: &TaskTracker, token: &CancellationToken) {
        let cfg = &self.config;

        let store = self.clone();
        let (delay, every) = (
            Duration::from_millis(cfg.merkle.startup_delay_ms),
            Duration::from_millis(cfg.merkle.flush_interval_ms),
        );
        tracker.spawn(periodic("merkle flusher", token.clone(), delay, every, move || {
            let store = store.clone();
            async move {
                store.flush_merkle(false);
                true
            }
        }));

        let store = self.clone();
        let (delay, every) = (
            Duration::from_millis(cfg.expire.startup_delay_ms),
            Duration::from_millis(cfg.expire.interval_ms),
        );
        tracker.spawn(periodic("expirer", token.clone(), delay, every, move || {
            let store = store.clone();
            async move {
                store.expire(now_micros());
                true
            }
        }));

        let store = self.clone();
        let every = Duration::from_millis(cfg.ring.maint_interval_ms);
        tracker.spawn(periodic("ring maintenance", token.clone(), Duration::ZERO, every, move || {
            let store = store.clone();
            async move {
                if let Err(e) = store.maintain_rings().await {
                    tracing::warn!("ring maintenance failed: {}", e);
                }
                true
            }
        }));

        let store = self.clone();
        let every = Duration::from_millis(cfg.ring.probe_interval_ms);
        tracker.spawn(periodic("peer probe", token.clone(), Duration::ZERO, every, move || {
            let store = store.clone();
            async move {
                store.probe_peers().await;
                true
            }
        }));

        let store = self.clone();
        let ae_token = token.clone();
        let every = Duration::from_millis(cfg.anti_entropy.interval_ms);
        let idle = Duration::from_millis(cfg.anti_entropy.idle_extra_ms);
        tracker.spawn(async move {
            loop {
                let converged = store.run_anti_entropy(&ae_token).await;
                let wait = if converged { every + idle } else { every };
                tokio::select! {
                    _ = ae_token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            tracing::debug!("anti-entropy stopped");
        });

        let idle = Duration::from_millis(cfg.ring.repartition_idle_ms);
        for db in self.databases.values() {
            tracker.spawn(repartition_loop(
                db.clone(),
                self.distributor.clone(),
                idle,
                token.clone(),
            ));
        }
    }

    /// Final flush once the background loops have stopped: leaf caches
    /// and queued Merkle changes, expiry queues, and a wait for every
    /// repartitioner to let go of its ring.
    pub async fn wind_down(&self) -> Result<(), StoreError> {
        for db in self.databases.values() {
            let _paused = db.ring().acquire_run().await;
            // an upper-level rewrite can queue its parent; bounded by tree height
            for _ in 0..=crate::merkle::HEIGHT {
                db.flush_merkle(true)?;
                if db.merkle().pending_changes() == 0 {
                    break;
                }
            }
            db.expirer().flush()?;
        }
        tracing::info!("server {} wound down", self.registry.local_id());
        Ok(())
    }
}

/// Run `tick` after `delay`, then every `every`, until `token` is
/// cancelled or `tick` returns false.
async fn periodic<F, Fut>(name: &'static str, token: CancellationToken, delay: Duration, every: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    loop {
        if !tick().await {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
    tracing::debug!("{} stopped", name);
}

#[async_trait::async_trait]
impl<C: PeerClient> PeerHandler for Store<C> {
    async fn handle_check(&self, req: &CheckRequest) -> Result<Vec<CheckItem>, PeerError> {
        let db = self.database(&req.database)?;
        db.get_merkle(req.level, req.tree_id, req.version, req.max_result)
            .map_err(|e| PeerError::RpcFailed(e.to_string()))
    }

    async fn handle_get(&self, database: &str, keys: &[KeyVersion]) -> Result<Vec<Datum>, PeerError> {
        let db = self.database(database)?;
        db.fetch_many(keys)
            .map_err(|e| PeerError::RpcFailed(e.to_string()))
    }

    /// Store the record, then pass it on if it was new here or this is
    /// the first hop.
    async fn handle_dist(&self, mut req: DistRequest) -> Result<PutStatus, PeerError> {
        let db = self.database(&req.database)?;
        let status = db
            .put(&mut req.datum)
            .map_err(|e| PeerError::RpcFailed(e.to_string()))?;
        if status == PutStatus::Done || req.hop == 0 {
            self.replicate(db, &req, false).await;
        }
        Ok(status)
    }

    fn handle_status(&self) -> ServerInfo {
        self.registry.local()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalNetwork, LocalPeerClient};
    use crate::ring_conf::ServerShards;

    fn config(id: &str, peers: &[&str]) -> NodeConfig {
        let mut yaml = format!(
            "server_id: {}\nlisten: \"127.0.0.1:7000\"\nstorage:\n  backend: memory\nring:\n  settle_secs: 0\ndatabases:\n  - name: users\n    expire_secs: 0\npeers:\n",
            id
        );
        for p in peers {
            yaml.push_str(&format!("  - id: {}\n    address: \"127.0.0.1:0\"\n", p));
        }
        if peers.is_empty() {
            yaml.push_str("  []\n");
        }
        ringkv_config::load_from_str(&yaml).unwrap()
    }

    fn cluster(ids: &[&str]) -> (Arc<LocalNetwork>, Vec<Arc<Store<LocalPeerClient>>>) {
        let network = LocalNetwork::new();
        let stores: Vec<_> = ids
            .iter()
            .map(|id| {
                let peers: Vec<&str> = ids.iter().copied().filter(|p| p != id).collect();
                let store = Arc::new(
                    Store::open(&config(id, &peers), &BackendRegistry::new(), Arc::new(network.client())).unwrap(),
                );
                network.register(id, &store);
                store
            })
            .collect();
        (network, stores)
    }

    #[tokio::test]
    async fn test_open_hosts_conf_and_configured_databases() {
        let (_net, stores) = cluster(&["a"]);
        let names: Vec<&str> = stores[0].databases().map(|d| d.name()).collect();
        assert_eq!(names, vec![CONF_DATABASE, "users"]);
        assert!(matches!(
            stores[0].database("nope"),
            Err(StoreError::UnknownDatabase(_))
        ));
    }

    #[tokio::test]
    async fn test_put_replicates_to_up_peers() {
        let (_net, stores) = cluster(&["a", "b", "c"]);
        for s in &stores {
            s.probe_peers().await;
        }
        let reply = stores[0]
            .put_and_wait("users", Datum::new("alice", b"1".to_vec()))
            .await
            .unwrap();
        assert_eq!(reply.status, PutStatus::Done);
        assert!(reply.version > 0);
        assert!(reply.confirmed() >= 1);

        // the first receiver forwards it on; give that a moment
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let everywhere = stores
                .iter()
                .all(|s| s.get("users", "alice").unwrap().is_some());
            if everywhere {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "write did not reach every server");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_remove_hides_value() {
        let (_net, stores) = cluster(&["a"]);
        let a = &stores[0];
        a.put("users", Datum::new("k", b"v".to_vec())).await.unwrap();
        assert!(a.get("users", "k").unwrap().is_some());
        assert_eq!(a.remove("users", "k").await.unwrap(), PutStatus::Done);
        assert!(a.get("users", "k").unwrap().is_none());
        // the tombstone itself is still a record
        assert!(a.database("users").unwrap().get("k", None).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ring_conf_applied_by_maintenance() {
        let (_net, stores) = cluster(&["a"]);
        let a = &stores[0];
        let conf = RingConf {
            version: now_micros(),
            replicas: 1,
            ring_bits: 4,
            servers: vec![ServerShards {
                id: "a".into(),
                datacenter: "default".into(),
                rack: "default".into(),
                shards: vec![0],
            }],
        };
        assert_eq!(a.put_ring_conf("users", &conf).await.unwrap(), PutStatus::Done);
        assert_eq!(a.ring_conf("users").unwrap(), Some(conf.clone()));

        assert_eq!(a.maintain_rings().await.unwrap(), 1);
        let ring = a.database("users").unwrap().ring();
        assert_eq!(ring.version(), conf.version);
        assert_eq!(ring.num_partitions(), 16);
        // nothing newer: no change
        assert_eq!(a.maintain_rings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_check_marks_peers() {
        let (net, stores) = cluster(&["a", "b"]);
        stores[0].probe_peers().await;
        assert!(stores[0].registry().is_up("b"));

        net.unregister("b");
        stores[0].probe_peers().await;
        assert!(!stores[0].registry().is_up("b"));
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_cancel() {
        let (_net, stores) = cluster(&["a"]);
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        stores[0].spawn_maintenance(&tracker, &token);
        stores[0].put("users", Datum::new("k", b"v".to_vec())).await.unwrap();

        token.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(10), tracker.wait())
            .await
            .unwrap();
        stores[0].wind_down().await.unwrap();
        assert_eq!(stores[0].database("users").unwrap().merkle().pending_changes(), 0);
    }
}
