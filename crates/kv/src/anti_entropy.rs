//! Merkle-driven anti-entropy.
//!
//! For each local partition, walk the tree depth-first against one peer:
//! request a node, compare the children it returns with our own, and push
//! every mismatching child back on the stack. Keys the peer holds at a
//! version we want are fetched in batches and written through
//! [`Database::put`].

use crate::database::{Database, DbError};
use crate::merkle::{CheckItem, CompareCache, LeafEntry, BUILD, HEIGHT};
use crate::peer_client::{CheckRequest, PeerClient, PeerError};
use parking_lot::Mutex;
use ringkv_common::{now_micros, KeyVersion, ServerInfo, WantIt};
use ringkv_config::AntiEntropyConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of one (partition, peer) pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub checks: usize,
    pub get_batches: usize,
    pub fetched: usize,
    pub repaired: usize,
    pub errors: usize,
    /// The walk ran to an empty stack without a single failed request.
    pub converged: bool,
}

enum Next {
    Node((u32, u64)),
    Wait,
    Finished,
}

/// Shared stack plus the number of nodes currently being compared, under
/// one lock so "empty and idle" is observed atomically.
#[derive(Default)]
struct Work {
    stack: Vec<(u32, u64)>,
    in_flight: usize,
}

struct Pass<'a> {
    db: &'a Database,
    part: usize,
    tree_id: u16,
    work: Mutex<Work>,
    wanted: Mutex<Vec<KeyVersion>>,
    /// Peer used for GETs; replaced when it fails and another answers.
    fetch_peer: Mutex<ServerInfo>,
    peer: ServerInfo,
    too_new: u64,
    done: CancellationToken,
    checks: AtomicUsize,
    get_batches: AtomicUsize,
    fetched: AtomicUsize,
    repaired: AtomicUsize,
    errors: AtomicUsize,
}

pub struct AntiEntropy<C: PeerClient> {
    client: Arc<C>,
    config: AntiEntropyConfig,
}

impl<C: PeerClient> std::fmt::Debug for AntiEntropy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiEntropy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: PeerClient> AntiEntropy<C> {
    pub fn new(client: Arc<C>, config: AntiEntropyConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &AntiEntropyConfig {
        &self.config
    }

    /// One cycle over every local partition of `db`, each against a random
    /// peer. True when every partition converged.
    pub async fn run_database(&self, db: &Database, token: &CancellationToken) -> bool {
        let ring = db.ring();
        let mut all_ok = true;
        for part in 0..ring.num_partitions() {
            if token.is_cancelled() {
                return false;
            }
            if !ring.is_local(part) {
                continue;
            }
            let Some(peer) = ring.random_peer(part, None) else {
                continue;
            };
            let report = self.sync_partition(db, part, &peer, token).await;
            tracing::debug!(
                "anti-entropy {}[{}] with {}: {} checks, {} fetched, {} repaired, converged={}",
                db.name(),
                part,
                peer.id,
                report.checks,
                report.fetched,
                report.repaired,
                report.converged
            );
            all_ok &= report.converged;
        }
        ringkv_metrics::metrics().ae_passes.inc();
        all_ok
    }

    /// Compare partition `part` of `db` against `peer` and pull whatever
    /// the peer has that we want.
    pub async fn sync_partition(
        &self,
        db: &Database,
        part: usize,
        peer: &ServerInfo,
        token: &CancellationToken,
    ) -> PassReport {
        let too_new = now_micros().saturating_sub(self.config.too_new_secs.saturating_mul(1_000_000));
        let pass = Pass {
            db,
            part,
            tree_id: db.ring().tree_id(part),
            work: Mutex::new(Work {
                stack: vec![(HEIGHT - BUILD, 0)],
                in_flight: 0,
            }),
            wanted: Mutex::new(Vec::new()),
            fetch_peer: Mutex::new(peer.clone()),
            peer: peer.clone(),
            too_new,
            done: token.child_token(),
            checks: AtomicUsize::new(0),
            get_batches: AtomicUsize::new(0),
            fetched: AtomicUsize::new(0),
            repaired: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        };

        let base = Duration::from_millis(self.config.worker_start_delay_ms);
        let workers = (0..self.config.workers.max(1)).map(|i| {
            let delay = if i == 0 { Duration::ZERO } else { base * (1u32 << (i - 1).min(16)) };
            self.worker(&pass, delay)
        });
        futures::future::join_all(workers).await;

        // whatever is left below the batch threshold
        let rest = std::mem::take(&mut *pass.wanted.lock());
        if !rest.is_empty() && !token.is_cancelled() {
            self.fetch(&pass, rest).await;
        }

        let errors = pass.errors.load(Ordering::Relaxed);
        let stack_empty = pass.work.lock().stack.is_empty();
        PassReport {
            checks: pass.checks.load(Ordering::Relaxed),
            get_batches: pass.get_batches.load(Ordering::Relaxed),
            fetched: pass.fetched.load(Ordering::Relaxed),
            repaired: pass.repaired.load(Ordering::Relaxed),
            errors,
            converged: stack_empty && errors == 0 && !token.is_cancelled(),
        }
    }

    async fn worker(&self, pass: &Pass<'_>, delay: Duration) {
        if !delay.is_zero() {
            tokio::select! {
                _ = pass.done.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        loop {
            if pass.done.is_cancelled() {
                return;
            }
            let next = {
                let mut work = pass.work.lock();
                match work.stack.pop() {
                    Some(node) => {
                        work.in_flight += 1;
                        Next::Node(node)
                    }
                    None if work.in_flight == 0 => Next::Finished,
                    None => Next::Wait,
                }
            };
            let (level, version) = match next {
                Next::Node(node) => node,
                Next::Wait => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    continue;
                }
                Next::Finished => {
                    pass.done.cancel();
                    return;
                }
            };

            let result = self.check_node(pass, level, version).await;
            pass.work.lock().in_flight -= 1;
            if let Err(e) = result {
                ringkv_metrics::metrics().ae_errors.inc();
                let errors = pass.errors.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "anti-entropy {}: check {:02}/{:012X} with {} failed: {}",
                    pass.db.name(),
                    level,
                    version >> 16,
                    pass.peer.id,
                    e
                );
                if errors > self.config.max_errors {
                    tracing::warn!(
                        "anti-entropy {}: giving up on {} after {} errors",
                        pass.db.name(),
                        pass.peer.id,
                        errors
                    );
                    pass.done.cancel();
                    return;
                }
            }
        }
    }

    async fn check_node(&self, pass: &Pass<'_>, level: u32, version: u64) -> Result<(), AeError> {
        let req = CheckRequest {
            database: pass.db.name().to_string(),
            level,
            tree_id: pass.tree_id,
            version,
            max_result: self.config.check_max_result,
        };
        pass.checks.fetch_add(1, Ordering::Relaxed);
        let items = self.with_timeout(self.client.check(&pass.peer, &req)).await?;

        // the reply may span several levels; only the deepest is compared
        let deepest = items.iter().map(CheckItem::level).max().unwrap_or(0);
        let mut cache = CompareCache::default();
        let mut batch = None;
        for item in items.iter().filter(|i| i.level() == deepest) {
            if item.version() > pass.too_new {
                continue;
            }
            match item {
                CheckItem::Key(entry) => {
                    if let Some(full) = self.consider_key(pass, entry)? {
                        batch = Some(full);
                    }
                }
                CheckItem::Node(summary) => {
                    if summary.valid && !pass.db.merkle().compare(summary, &mut cache)? {
                        pass.work.lock().stack.push((summary.level, summary.version));
                    }
                }
            }
        }
        if let Some(keys) = batch {
            self.fetch(pass, keys).await;
        }
        Ok(())
    }

    /// Queue `entry` if we want it. Returns a full batch when the queue
    /// reaches the batch size.
    fn consider_key(&self, pass: &Pass<'_>, entry: &LeafEntry) -> Result<Option<Vec<KeyVersion>>, AeError> {
        let db = pass.db;
        let ring = db.ring();
        let npart = ring.partition_of(entry.shard);
        if npart != pass.part && !ring.is_local(npart) {
            return Ok(None);
        }
        match db.want_it(&entry.key, entry.version)? {
            WantIt::Want => {
                let mut wanted = pass.wanted.lock();
                wanted.push(KeyVersion {
                    key: entry.key.clone(),
                    version: entry.version,
                });
                if wanted.len() >= self.config.batch_size {
                    return Ok(Some(std::mem::take(&mut *wanted)));
                }
            }
            WantIt::Have => {
                // same record, but our tree may have lost track of it
                if db.restore_leaf(entry)? {
                    pass.repaired.fetch_add(1, Ordering::Relaxed);
                    ringkv_metrics::metrics().ae_tree_repairs.inc();
                }
            }
            WantIt::LocalNewer => {}
        }
        Ok(None)
    }

    /// GET `keys` from the fetch peer, falling back to one other peer, and
    /// write what comes back.
    async fn fetch(&self, pass: &Pass<'_>, keys: Vec<KeyVersion>) {
        let db = pass.db;
        let peer = pass.fetch_peer.lock().clone();
        pass.get_batches.fetch_add(1, Ordering::Relaxed);

        let data = match self.with_timeout(self.client.get(&peer, db.name(), &keys)).await {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!("anti-entropy {}: get from {} failed: {}", db.name(), peer.id, e);
                let retry = match db.ring().random_peer(pass.part, Some(&peer.id)) {
                    Some(other) => self
                        .with_timeout(self.client.get(&other, db.name(), &keys))
                        .await
                        .map(|data| (other, data)),
                    None => Err(e),
                };
                match retry {
                    Ok((other, data)) => {
                        *pass.fetch_peer.lock() = other;
                        data
                    }
                    Err(e) => {
                        ringkv_metrics::metrics().ae_errors.inc();
                        pass.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            "anti-entropy {}: could not fetch {} keys: {}",
                            db.name(),
                            keys.len(),
                            e
                        );
                        return;
                    }
                }
            }
        };

        for mut datum in data {
            match db.put(&mut datum) {
                Ok(_) => {
                    pass.fetched.fetch_add(1, Ordering::Relaxed);
                    ringkv_metrics::metrics().ae_fetched.inc();
                }
                Err(e) => {
                    pass.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("anti-entropy {}: storing {:?} failed: {}", db.name(), datum.key, e);
                }
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, PeerError>>,
    ) -> Result<T, PeerError> {
        match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), fut).await {
            Ok(r) => r,
            Err(_) => Err(PeerError::Timeout),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AeError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Merkle(#[from] crate::merkle::MerkleError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distrib::DistRequest;
    use crate::registry::ServerRegistry;
    use ringkv_common::{Datum, PutStatus};
    use ringkv_storage::MemoryStore;

    /// Answers CHECK and GET from one database; can be told to fail.
    struct DbClient {
        db: Arc<Database>,
        fail: bool,
        checks: AtomicUsize,
        gets: AtomicUsize,
    }

    impl DbClient {
        fn new(db: Arc<Database>) -> Self {
            Self {
                db,
                fail: false,
                checks: AtomicUsize::new(0),
                gets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl PeerClient for DbClient {
        async fn check(&self, _t: &ServerInfo, req: &CheckRequest) -> Result<Vec<CheckItem>, PeerError> {
            self.checks.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(PeerError::RpcFailed("down".into()));
            }
            self.db
                .get_merkle(req.level, req.tree_id, req.version, req.max_result)
                .map_err(|e| PeerError::RpcFailed(e.to_string()))
        }

        async fn get(&self, _t: &ServerInfo, _db: &str, keys: &[KeyVersion]) -> Result<Vec<Datum>, PeerError> {
            self.gets.fetch_add(1, Ordering::Relaxed);
            self.db
                .fetch_many(keys)
                .map_err(|e| PeerError::RpcFailed(e.to_string()))
        }

        async fn distribute(&self, _t: &ServerInfo, _r: &DistRequest) -> Result<PutStatus, PeerError> {
            Ok(PutStatus::Done)
        }
    }

    fn node(id: &str) -> Arc<Database> {
        let registry = Arc::new(ServerRegistry::new(ServerInfo::new(id, "east", "r1", "")));
        Arc::new(Database::new("db", Arc::new(MemoryStore::new()), registry))
    }

    fn peer() -> ServerInfo {
        ServerInfo::new("b", "east", "r1", "")
    }

    fn put_at(db: &Database, key: &str, version: u64) {
        let mut d = Datum::new(key, b"v".to_vec()).with_version(version);
        assert_eq!(db.put(&mut d).unwrap(), PutStatus::Done);
    }

    fn config() -> AntiEntropyConfig {
        AntiEntropyConfig {
            worker_start_delay_ms: 1,
            ..AntiEntropyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_one_missing_key_walks_one_path() {
        let a = node("a");
        let b = node("b");
        let base = now_micros() - 600_000_000;
        for i in 0..20u64 {
            put_at(&a, &format!("common-{}", i), base + i * 1_000_000);
            put_at(&b, &format!("common-{}", i), base + i * 1_000_000);
        }
        put_at(&b, "extra", base + 100_000_000);
        a.flush_merkle(true).unwrap();
        b.flush_merkle(true).unwrap();

        let client = Arc::new(DbClient::new(b.clone()));
        let ae = AntiEntropy::new(
            client.clone(),
            AntiEntropyConfig {
                check_max_result: 1,
                ..config()
            },
        );
        let report = ae.sync_partition(&a, 0, &peer(), &CancellationToken::new()).await;

        assert!(report.converged);
        assert_eq!(report.checks, (BUILD + 1) as usize);
        assert_eq!(report.get_batches, 1);
        assert_eq!(report.fetched, 1);
        assert_eq!(client.gets.load(Ordering::Relaxed), 1);
        assert!(a.get("extra", None).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_identical_trees_stop_at_root() {
        let a = node("a");
        let b = node("b");
        let base = now_micros() - 600_000_000;
        for i in 0..10u64 {
            put_at(&a, &format!("k{}", i), base + i);
            put_at(&b, &format!("k{}", i), base + i);
        }
        a.flush_merkle(true).unwrap();
        b.flush_merkle(true).unwrap();

        let ae = AntiEntropy::new(Arc::new(DbClient::new(b)), config());
        let report = ae.sync_partition(&a, 0, &peer(), &CancellationToken::new()).await;
        assert!(report.converged);
        assert_eq!(report.checks, 1);
        assert_eq!(report.get_batches, 0);
    }

    #[tokio::test]
    async fn test_disjoint_writes_converge() {
        let a = node("a");
        let b = node("b");
        let base = now_micros() - 600_000_000;
        for i in 0..150u64 {
            let db = if i % 2 == 0 { &a } else { &b };
            put_at(db, &format!("key-{}", i), base + i * 3_000_000);
        }
        a.flush_merkle(true).unwrap();
        b.flush_merkle(true).unwrap();

        let token = CancellationToken::new();
        let from_b = AntiEntropy::new(Arc::new(DbClient::new(b.clone())), config());
        let from_a = AntiEntropy::new(Arc::new(DbClient::new(a.clone())), config());
        assert!(from_b.sync_partition(&a, 0, &peer(), &token).await.converged);
        assert!(from_a.sync_partition(&b, 0, &peer(), &token).await.converged);

        for i in 0..150u64 {
            let k = format!("key-{}", i);
            assert!(a.get(&k, None).unwrap().is_some(), "a lacks {}", k);
            assert!(b.get(&k, None).unwrap().is_some(), "b lacks {}", k);
        }

        // a second round finds nothing to do
        a.flush_merkle(true).unwrap();
        b.flush_merkle(true).unwrap();
        let again = from_b.sync_partition(&a, 0, &peer(), &token).await;
        assert_eq!(again.checks, 1);
    }

    #[tokio::test]
    async fn test_newer_local_version_is_kept() {
        let a = node("a");
        let b = node("b");
        let base = now_micros() - 600_000_000;
        put_at(&a, "k", base + 5_000_000);
        put_at(&b, "k", base);
        a.flush_merkle(true).unwrap();
        b.flush_merkle(true).unwrap();

        let ae = AntiEntropy::new(Arc::new(DbClient::new(b)), config());
        let report = ae.sync_partition(&a, 0, &peer(), &CancellationToken::new()).await;
        assert!(report.converged);
        assert_eq!(report.fetched, 0);
        assert_eq!(a.get("k", None).unwrap().unwrap().version, base + 5_000_000);
    }

    #[tokio::test]
    async fn test_too_new_entries_are_skipped() {
        let a = node("a");
        let b = node("b");
        put_at(&b, "fresh", now_micros());
        b.flush_merkle(true).unwrap();

        let ae = AntiEntropy::new(Arc::new(DbClient::new(b)), config());
        let report = ae.sync_partition(&a, 0, &peer(), &CancellationToken::new()).await;
        assert_eq!(report.fetched, 0);
        assert!(a.get("fresh", None).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_leaf_entry_is_restored() {
        let a = node("a");
        let b = node("b");
        let v = now_micros() - 600_000_000;
        put_at(&a, "k", v);
        put_at(&b, "k", v);
        let shard = a.get("k", None).unwrap().unwrap().shard;
        a.merkle().del("k", 0, shard, v).unwrap();
        a.flush_merkle(true).unwrap();
        b.flush_merkle(true).unwrap();
        assert!(!a.merkle().contains("k", 0, v).unwrap());

        let ae = AntiEntropy::new(Arc::new(DbClient::new(b)), config());
        let report = ae.sync_partition(&a, 0, &peer(), &CancellationToken::new()).await;
        assert_eq!(report.repaired, 1);
        assert_eq!(report.fetched, 0);
        assert!(a.merkle().contains("k", 0, v).unwrap());
    }

    #[tokio::test]
    async fn test_failed_check_is_not_converged() {
        let a = node("a");
        let mut client = DbClient::new(node("b"));
        client.fail = true;
        let client = Arc::new(client);
        let ae = AntiEntropy::new(
            client.clone(),
            AntiEntropyConfig {
                max_errors: 3,
                ..config()
            },
        );
        let report = ae.sync_partition(&a, 0, &peer(), &CancellationToken::new()).await;
        assert!(!report.converged);
        // the root check fails once; nothing else is ever queued
        assert_eq!(client.checks.load(Ordering::Relaxed), 1);
        assert_eq!(report.errors, 1);
    }
}
