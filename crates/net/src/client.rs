//! gRPC client implementing [`PeerClient`].
//!
//! `GrpcPeerClient` keeps one tonic channel per server id, created on
//! first use from the server's registered address and dropped again when
//! a call on it fails.

use crate::convert;
use ringkv_common::{Datum, KeyVersion, PutStatus, ServerInfo};
use ringkv_kv::distrib::DistRequest;
use ringkv_kv::merkle::CheckItem;
use ringkv_kv::peer_client::{CheckRequest, PeerClient, PeerError};
use ringkv_proto::peer::peer_service_client::PeerServiceClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug)]
pub struct GrpcPeerClient {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
    connect_timeout: Duration,
}

impl Default for GrpcPeerClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl GrpcPeerClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
        }
    }

    async fn get_channel(&self, target: &ServerInfo) -> Result<Channel, PeerError> {
        {
            let cache = self.channels.read().await;
            if let Some(channel) = cache.get(&target.id) {
                return Ok(channel.clone());
            }
        }

        if target.address.is_empty() {
            return Err(PeerError::RpcFailed(format!("no address for {}", target.id)));
        }
        let endpoint = Endpoint::from_shared(format!("http://{}", target.address))
            .map_err(|e| PeerError::RpcFailed(format!("invalid endpoint: {}", e)))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| PeerError::RpcFailed(format!("connect to {} failed: {}", target.id, e)))?;

        self.channels
            .write()
            .await
            .insert(target.id.clone(), channel.clone());
        Ok(channel)
    }

    /// Drop the cached channel to `server_id`.
    pub async fn invalidate(&self, server_id: &str) {
        self.channels.write().await.remove(server_id);
    }

    async fn client(&self, target: &ServerInfo, rpc: &str) -> Result<PeerServiceClient<Channel>, PeerError> {
        ringkv_metrics::metrics()
            .rpcs_sent_by_type
            .with_label_values(&[rpc])
            .inc();
        Ok(PeerServiceClient::new(self.get_channel(target).await?))
    }

    async fn failed(&self, target: &ServerInfo, rpc: &str, status: tonic::Status) -> PeerError {
        ringkv_metrics::metrics()
            .rpc_errors_by_type
            .with_label_values(&[rpc])
            .inc();
        tracing::debug!("{} to {} failed: {}", rpc, target.id, status);
        if status.code() == tonic::Code::Unavailable {
            self.invalidate(&target.id).await;
        }
        PeerError::RpcFailed(format!("{} to {} failed: {}", rpc, target.id, status))
    }
}

#[async_trait::async_trait]
impl PeerClient for GrpcPeerClient {
    async fn check(&self, target: &ServerInfo, req: &CheckRequest) -> Result<Vec<CheckItem>, PeerError> {
        let _timer = ringkv_metrics::start_rpc_timer("check", "outbound");
        let mut client = self.client(target, "check").await?;
        let resp = match client.check(convert::check_request_to_proto(req)).await {
            Ok(r) => r.into_inner(),
            Err(status) => return Err(self.failed(target, "check", status).await),
        };
        resp.items
            .into_iter()
            .map(convert::check_item_from_proto)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PeerError::RpcFailed)
    }

    async fn get(&self, target: &ServerInfo, database: &str, keys: &[KeyVersion]) -> Result<Vec<Datum>, PeerError> {
        let _timer = ringkv_metrics::start_rpc_timer("get", "outbound");
        let mut client = self.client(target, "get").await?;
        let req = ringkv_proto::peer::GetRequest {
            database: database.to_string(),
            keys: keys.iter().map(convert::key_version_to_proto).collect(),
        };
        match client.get(req).await {
            Ok(r) => Ok(r
                .into_inner()
                .data
                .into_iter()
                .map(convert::datum_from_proto)
                .collect()),
            Err(status) => Err(self.failed(target, "get", status).await),
        }
    }

    async fn distribute(&self, target: &ServerInfo, req: &DistRequest) -> Result<PutStatus, PeerError> {
        let _timer = ringkv_metrics::start_rpc_timer("distribute", "outbound");
        let mut client = self.client(target, "distribute").await?;
        match client.distribute(convert::dist_request_to_proto(req)).await {
            Ok(r) => Ok(PutStatus::from_code(r.into_inner().status)),
            Err(status) => Err(self.failed(target, "distribute", status).await),
        }
    }

    async fn status(&self, target: &ServerInfo) -> Result<ServerInfo, PeerError> {
        let mut client = self.client(target, "status").await?;
        match client.status(ringkv_proto::peer::StatusRequest {}).await {
            Ok(r) => r
                .into_inner()
                .server
                .map(convert::server_from_proto)
                .ok_or_else(|| PeerError::RpcFailed("status reply without server".into())),
            Err(status) => Err(self.failed(target, "status", status).await),
        }
    }
}
