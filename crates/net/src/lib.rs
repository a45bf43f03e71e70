//! gRPC networking layer for ringkv.
//!
//! Provides:
//! - `GrpcPeerClient`: implements `PeerClient` over tonic
//! - `PeerServiceImpl`: bridges the peer proto to the node's `PeerHandler`
//! - `KvServiceImpl`: client put/get/remove against the node's `Store`
//! - `AdminServiceImpl`: health, ring inspection and ring configuration
//! - `build_server`: assembles all services into a tonic `Router`

#![allow(clippy::result_large_err)]

pub mod client;
pub mod convert;
pub mod server;

pub use client::GrpcPeerClient;
pub use server::{AdminServiceImpl, KvServiceImpl, PeerServiceImpl};

use ringkv_admin::RingAdmin;
use ringkv_kv::{PeerClient, Store};
use std::sync::Arc;
use std::time::Instant;

/// Build a tonic `Router` with all gRPC services.
pub fn build_server<C: PeerClient>(store: Arc<Store<C>>) -> tonic::transport::server::Router {
    let peer_svc = PeerServiceImpl { store: store.clone() };
    let kv_svc = KvServiceImpl { store: store.clone() };
    let admin_svc = AdminServiceImpl {
        admin: RingAdmin::new(store),
        start_time: Instant::now(),
    };

    tonic::transport::Server::builder()
        .add_service(ringkv_proto::peer::peer_service_server::PeerServiceServer::new(
            peer_svc,
        ))
        .add_service(ringkv_proto::kv::kv_service_server::KvServiceServer::new(
            kv_svc,
        ))
        .add_service(ringkv_proto::admin::admin_service_server::AdminServiceServer::new(admin_svc))
}
