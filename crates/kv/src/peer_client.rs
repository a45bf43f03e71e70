//! Abstraction over peer-to-peer RPCs.
//!
//! The core only needs three request kinds (CHECK, GET, DIST) plus a
//! liveness probe. The gRPC implementation lives in `ringkv-net`; tests use
//! [`crate::local::LocalPeerClient`].

use crate::distrib::DistRequest;
use crate::merkle::CheckItem;
use ringkv_common::{Datum, KeyVersion, PutStatus, ServerInfo};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("RPC failed: {0}")]
    RpcFailed(String),
    #[error("timeout")]
    Timeout,
}

/// Ask a peer for one node of its Merkle tree, expanded downward while the
/// reply stays under `max_result` items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub database: String,
    pub level: u32,
    pub tree_id: u16,
    pub version: u64,
    /// 0 means the server default.
    pub max_result: usize,
}

/// Outbound side: what this node asks of its peers.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn check(&self, target: &ServerInfo, req: &CheckRequest) -> Result<Vec<CheckItem>, PeerError>;

    /// Fetch the listed `(key, version)` pairs. Keys the peer no longer
    /// holds at that version are left out of the reply.
    async fn get(
        &self,
        target: &ServerInfo,
        database: &str,
        keys: &[KeyVersion],
    ) -> Result<Vec<Datum>, PeerError>;

    async fn distribute(&self, target: &ServerInfo, req: &DistRequest) -> Result<PutStatus, PeerError>;

    /// The peer's own view of itself.
    async fn status(&self, _target: &ServerInfo) -> Result<ServerInfo, PeerError> {
        Err(PeerError::RpcFailed("status probe not supported".into()))
    }
}

/// Inbound side: how a node answers its peers.
#[async_trait::async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn handle_check(&self, req: &CheckRequest) -> Result<Vec<CheckItem>, PeerError>;

    async fn handle_get(&self, database: &str, keys: &[KeyVersion]) -> Result<Vec<Datum>, PeerError>;

    async fn handle_dist(&self, req: DistRequest) -> Result<PutStatus, PeerError>;

    fn handle_status(&self) -> ServerInfo;
}
