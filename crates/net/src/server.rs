//! gRPC service implementations.
//!
//! Bridges tonic-generated service traits to the domain logic in the `kv`
//! and `admin` crates.

use crate::convert;
use ringkv_admin::{AdminError, RingAdmin};
use ringkv_common::Datum;
use ringkv_kv::peer_client::PeerError;
use ringkv_kv::{PeerClient, PeerHandler, Store, StoreError};
use ringkv_proto::{admin as pa, kv as pk, peer as pp};
use std::sync::Arc;
use std::time::Instant as StdInstant;

fn peer_status(e: PeerError) -> tonic::Status {
    match e {
        PeerError::Timeout => tonic::Status::deadline_exceeded("timed out"),
        PeerError::RpcFailed(msg) => tonic::Status::internal(msg),
    }
}

fn store_status(e: StoreError) -> tonic::Status {
    match e {
        StoreError::UnknownDatabase(name) => tonic::Status::not_found(format!("unknown database: {}", name)),
        other => tonic::Status::internal(other.to_string()),
    }
}

fn admin_status(e: AdminError) -> tonic::Status {
    match e {
        AdminError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
        AdminError::UnknownServer(_) => tonic::Status::not_found(e.to_string()),
        AdminError::NotConfigured(_) | AdminError::NoRingConf(_) => tonic::Status::failed_precondition(e.to_string()),
        AdminError::VersionConflict { .. } => tonic::Status::aborted(e.to_string()),
        AdminError::Store(e) => store_status(e),
    }
}

fn count_inbound(rpc: &str) {
    ringkv_metrics::metrics()
        .rpcs_received_by_type
        .with_label_values(&[rpc])
        .inc();
}

// ---------------------------------------------------------------------------
// Peer gRPC service (node-to-node)
// ---------------------------------------------------------------------------

pub struct PeerServiceImpl<C: PeerClient> {
    pub store: Arc<Store<C>>,
}

impl<C: PeerClient> std::fmt::Debug for PeerServiceImpl<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerServiceImpl").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<C: PeerClient> pp::peer_service_server::PeerService for PeerServiceImpl<C> {
    async fn check(
        &self,
        request: tonic::Request<pp::CheckRequest>,
    ) -> Result<tonic::Response<pp::CheckResponse>, tonic::Status> {
        count_inbound("check");
        let _timer = ringkv_metrics::start_rpc_timer("check", "inbound");
        let req = convert::check_request_from_proto(request.into_inner())?;
        let items = self.store.handle_check(&req).await.map_err(peer_status)?;
        Ok(tonic::Response::new(pp::CheckResponse {
            items: items.iter().map(convert::check_item_to_proto).collect(),
        }))
    }

    async fn get(
        &self,
        request: tonic::Request<pp::GetRequest>,
    ) -> Result<tonic::Response<pp::GetResponse>, tonic::Status> {
        count_inbound("get");
        let _timer = ringkv_metrics::start_rpc_timer("get", "inbound");
        let req = request.into_inner();
        let keys: Vec<_> = req
            .keys
            .into_iter()
            .map(convert::key_version_from_proto)
            .collect();
        let data = self
            .store
            .handle_get(&req.database, &keys)
            .await
            .map_err(peer_status)?;
        Ok(tonic::Response::new(pp::GetResponse {
            data: data.iter().map(convert::datum_to_proto).collect(),
        }))
    }

    async fn distribute(
        &self,
        request: tonic::Request<pp::DistRequest>,
    ) -> Result<tonic::Response<pp::DistResponse>, tonic::Status> {
        count_inbound("distribute");
        let _timer = ringkv_metrics::start_rpc_timer("distribute", "inbound");
        let req = convert::dist_request_from_proto(request.into_inner())?;
        let status = self.store.handle_dist(req).await.map_err(peer_status)?;
        Ok(tonic::Response::new(convert::status_to_proto(status)))
    }

    async fn status(
        &self,
        _request: tonic::Request<pp::StatusRequest>,
    ) -> Result<tonic::Response<pp::StatusResponse>, tonic::Status> {
        count_inbound("status");
        Ok(tonic::Response::new(pp::StatusResponse {
            server: Some(convert::server_to_proto(&self.store.handle_status())),
        }))
    }
}

// ---------------------------------------------------------------------------
// KV gRPC service (clients)
// ---------------------------------------------------------------------------

pub struct KvServiceImpl<C: PeerClient> {
    pub store: Arc<Store<C>>,
}

impl<C: PeerClient> std::fmt::Debug for KvServiceImpl<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvServiceImpl").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<C: PeerClient> pk::kv_service_server::KvService for KvServiceImpl<C> {
    async fn put(
        &self,
        request: tonic::Request<pk::PutRequest>,
    ) -> Result<tonic::Response<pk::PutResponse>, tonic::Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(tonic::Status::invalid_argument("empty key"));
        }
        let datum = Datum {
            key: req.key,
            value: Some(req.value),
            version: req.version,
            shard: None,
            expire: req.expire,
            program: (!req.program.is_empty()).then_some(req.program),
        };
        let reply = self
            .store
            .write(&req.database, datum, req.wait)
            .await
            .map_err(store_status)?;

        Ok(tonic::Response::new(pk::PutResponse {
            status: reply.status.code(),
            status_name: reply.status.as_str().to_string(),
            version: reply.version,
            replicas_confirmed: reply.confirmed(),
        }))
    }

    async fn get(
        &self,
        request: tonic::Request<pk::GetRequest>,
    ) -> Result<tonic::Response<pk::GetResponse>, tonic::Status> {
        let req = request.into_inner();
        let found = self
            .store
            .get(&req.database, &req.key)
            .map_err(store_status)?;
        Ok(tonic::Response::new(pk::GetResponse {
            found: found.is_some(),
            datum: found.as_ref().map(convert::datum_to_proto),
        }))
    }

    async fn remove(
        &self,
        request: tonic::Request<pk::RemoveRequest>,
    ) -> Result<tonic::Response<pk::RemoveResponse>, tonic::Status> {
        let req = request.into_inner();
        let status = self
            .store
            .remove(&req.database, &req.key)
            .await
            .map_err(store_status)?;
        Ok(tonic::Response::new(pk::RemoveResponse {
            status: status.code(),
            status_name: status.as_str().to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Admin gRPC service
// ---------------------------------------------------------------------------

pub struct AdminServiceImpl<C: PeerClient> {
    pub admin: RingAdmin<C>,
    pub start_time: StdInstant,
}

impl<C: PeerClient> std::fmt::Debug for AdminServiceImpl<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminServiceImpl").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl<C: PeerClient> pa::admin_service_server::AdminService for AdminServiceImpl<C> {
    async fn health(
        &self,
        _request: tonic::Request<pa::HealthRequest>,
    ) -> Result<tonic::Response<pa::HealthResponse>, tonic::Status> {
        let local = self.admin.store().registry().local();
        Ok(tonic::Response::new(pa::HealthResponse {
            healthy: true,
            server_id: local.id,
            uptime_secs: self.start_time.elapsed().as_secs(),
            uptodate: local.uptodate,
        }))
    }

    async fn ring_view(
        &self,
        request: tonic::Request<pa::RingViewRequest>,
    ) -> Result<tonic::Response<pa::RingViewResponse>, tonic::Status> {
        let req = request.into_inner();
        let store = self.admin.store();
        let ring = store.database(&req.database).map_err(store_status)?.ring();

        let partitions = (0..ring.num_partitions())
            .filter_map(|i| ring.partition(i))
            .map(|p| pa::PartitionView {
                index: p.index as u32,
                shard_start: p.shard_start,
                servers: p.servers(),
                local: p.is_local,
                stable_version: p.stable_version,
            })
            .collect();

        Ok(tonic::Response::new(pa::RingViewResponse {
            version: ring.version(),
            bits: ring.bits(),
            replicas: ring.replicas(),
            stable: ring.is_stable(),
            partitions,
            servers: store
                .registry()
                .all()
                .iter()
                .map(convert::server_to_proto)
                .collect(),
        }))
    }

    async fn init_ring(
        &self,
        request: tonic::Request<pa::InitRingRequest>,
    ) -> Result<tonic::Response<pa::RingConfResponse>, tonic::Status> {
        let req = request.into_inner();
        let conf = self.admin.init(&req.database).await.map_err(admin_status)?;
        Ok(tonic::Response::new(convert::ring_conf_to_proto(&conf)))
    }

    async fn set_bits(
        &self,
        request: tonic::Request<pa::SetBitsRequest>,
    ) -> Result<tonic::Response<pa::RingConfResponse>, tonic::Status> {
        let req = request.into_inner();
        let conf = self
            .admin
            .set_bits(&req.database, req.bits)
            .await
            .map_err(admin_status)?;
        Ok(tonic::Response::new(convert::ring_conf_to_proto(&conf)))
    }

    async fn set_replicas(
        &self,
        request: tonic::Request<pa::SetReplicasRequest>,
    ) -> Result<tonic::Response<pa::RingConfResponse>, tonic::Status> {
        let req = request.into_inner();
        let conf = self
            .admin
            .set_replicas(&req.database, req.replicas)
            .await
            .map_err(admin_status)?;
        Ok(tonic::Response::new(convert::ring_conf_to_proto(&conf)))
    }

    async fn add_node(
        &self,
        request: tonic::Request<pa::AddNodeRequest>,
    ) -> Result<tonic::Response<pa::RingConfResponse>, tonic::Status> {
        let req = request.into_inner();
        let conf = if req.slots > 0 {
            self.admin.add_slots(&req.database, &req.server, req.slots).await
        } else {
            self.admin.add_node(&req.database, &req.server, req.shard).await
        }
        .map_err(admin_status)?;
        Ok(tonic::Response::new(convert::ring_conf_to_proto(&conf)))
    }

    async fn remove_node(
        &self,
        request: tonic::Request<pa::RemoveNodeRequest>,
    ) -> Result<tonic::Response<pa::RingConfResponse>, tonic::Status> {
        let req = request.into_inner();
        let conf = self
            .admin
            .remove_node(&req.database, &req.server)
            .await
            .map_err(admin_status)?;
        Ok(tonic::Response::new(convert::ring_conf_to_proto(&conf)))
    }
}
