//! Chaos injection wrapper for [`PeerClient`].
//!
//! [`ChaosPeerClient`] wraps any `C: PeerClient` and injects configurable
//! failures: random errors, per-server outages, and latency.

use crate::distrib::DistRequest;
use crate::merkle::CheckItem;
use crate::peer_client::{CheckRequest, PeerClient, PeerError};
use rand::Rng;
use ringkv_common::{Datum, KeyVersion, PutStatus, ServerInfo};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for peer chaos injection.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

/// A [`PeerClient`] wrapper that injects chaos (failures, latency, per-server blocks).
pub struct ChaosPeerClient<C: PeerClient> {
    inner: Arc<C>,
    config: Arc<RwLock<ChaosConfig>>,
    /// Servers explicitly marked as failed.
    failed: Arc<RwLock<HashSet<String>>>,
}

impl<C: PeerClient> std::fmt::Debug for ChaosPeerClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosPeerClient").finish_non_exhaustive()
    }
}

impl<C: PeerClient> ChaosPeerClient<C> {
    pub fn new(inner: Arc<C>, config: ChaosConfig) -> Self {
        Self {
            inner,
            config: Arc::new(RwLock::new(config)),
            failed: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    /// Fail every request to `server_id` until recovered.
    pub async fn fail_node(&self, server_id: &str) {
        self.failed.write().await.insert(server_id.to_string());
    }

    pub async fn recover_node(&self, server_id: &str) {
        self.failed.write().await.remove(server_id);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    async fn maybe_fail(&self, target: &ServerInfo) -> Result<(), PeerError> {
        if self.failed.read().await.contains(&target.id) {
            return Err(PeerError::RpcFailed("chaos: server marked as failed".into()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (config.latency + Duration::from_millis(jitter_ms), config.failure_rate)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(PeerError::RpcFailed("chaos: random failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<C: PeerClient> PeerClient for ChaosPeerClient<C> {
    async fn check(&self, target: &ServerInfo, req: &CheckRequest) -> Result<Vec<CheckItem>, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.check(target, req).await
    }

    async fn get(&self, target: &ServerInfo, database: &str, keys: &[KeyVersion]) -> Result<Vec<Datum>, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.get(target, database, keys).await
    }

    async fn distribute(&self, target: &ServerInfo, req: &DistRequest) -> Result<PutStatus, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.distribute(target, req).await
    }

    async fn status(&self, target: &ServerInfo) -> Result<ServerInfo, PeerError> {
        self.maybe_fail(target).await?;
        self.inner.status(target).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct OkClient;

    #[async_trait::async_trait]
    impl PeerClient for OkClient {
        async fn check(&self, _t: &ServerInfo, _r: &CheckRequest) -> Result<Vec<CheckItem>, PeerError> {
            Ok(vec![])
        }

        async fn get(&self, _t: &ServerInfo, _db: &str, _k: &[KeyVersion]) -> Result<Vec<Datum>, PeerError> {
            Ok(vec![])
        }

        async fn distribute(&self, _t: &ServerInfo, _r: &DistRequest) -> Result<PutStatus, PeerError> {
            Ok(PutStatus::Done)
        }

        async fn status(&self, t: &ServerInfo) -> Result<ServerInfo, PeerError> {
            Ok(t.clone())
        }
    }

    fn target(id: &str) -> ServerInfo {
        ServerInfo::new(id, "east", "r1", "127.0.0.1:1")
    }

    fn dist() -> DistRequest {
        DistRequest::new("db", Datum::new("key", b"val".to_vec()))
    }

    #[tokio::test]
    async fn test_chaos_passthrough() {
        let chaos = ChaosPeerClient::new(Arc::new(OkClient), ChaosConfig::default());
        let t = target("n1");
        assert_eq!(chaos.distribute(&t, &dist()).await.unwrap(), PutStatus::Done);
        assert!(chaos.get(&t, "db", &[]).await.is_ok());
        assert_eq!(chaos.status(&t).await.unwrap().id, "n1");
    }

    #[tokio::test]
    async fn test_chaos_fail_and_recover_node() {
        let chaos = ChaosPeerClient::new(Arc::new(OkClient), ChaosConfig::default());
        let t = target("n1");

        chaos.fail_node("n1").await;
        assert!(chaos.distribute(&t, &dist()).await.is_err());
        assert!(chaos.status(&t).await.is_err());
        // other servers still work
        assert!(chaos.distribute(&target("n2"), &dist()).await.is_ok());

        chaos.recover_node("n1").await;
        assert!(chaos.distribute(&t, &dist()).await.is_ok());
    }

    #[tokio::test]
    async fn test_chaos_random_failure() {
        let config = ChaosConfig {
            failure_rate: 1.0,
            ..Default::default()
        };
        let chaos = ChaosPeerClient::new(Arc::new(OkClient), config);
        let t = target("n1");
        for _ in 0..10 {
            assert!(chaos.get(&t, "db", &[]).await.is_err());
        }

        chaos.set_failure_rate(0.0).await;
        assert!(chaos.get(&t, "db", &[]).await.is_ok());
    }
}
