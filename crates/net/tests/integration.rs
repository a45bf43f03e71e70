//! Integration test: spin up nodes with real gRPC listeners, then write,
//! read and reconfigure them through the client and admin services.

use ringkv_kv::Store;
use ringkv_net::{build_server, GrpcPeerClient};
use ringkv_proto::admin::admin_service_client::AdminServiceClient;
use ringkv_proto::kv::kv_service_client::KvServiceClient;
use ringkv_storage::BackendRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

struct TestNode {
    addr: SocketAddr,
    store: Arc<Store<GrpcPeerClient>>,
    _dir: tempfile::TempDir,
}

/// `peers` are `(id, port)` pairs.
fn node_yaml(id: &str, port: u16, peers: &[(&str, u16)], dir: &std::path::Path) -> String {
    let mut yaml = format!(
        r#"
server_id: {id}
listen: "127.0.0.1:{port}"
storage:
  backend: memory
  data_dir: "{dir}"
  fsync: none
databases:
  - name: users
    replicas: 2
    ring_bits: 4
distribute:
  timeout_ms: 2000
"#,
        id = id,
        port = port,
        dir = dir.display(),
    );
    if !peers.is_empty() {
        yaml.push_str("peers:\n");
    }
    for (peer, peer_port) in peers {
        yaml.push_str(&format!(
            "  - id: {}\n    address: \"127.0.0.1:{}\"\n",
            peer, peer_port
        ));
    }
    yaml
}

async fn spawn_node(id: &str, port: u16, peers: &[(&str, u16)]) -> TestNode {
    let dir = tempfile::TempDir::new().unwrap();
    let config = ringkv_config::load_from_str(&node_yaml(id, port, peers, dir.path())).unwrap();
    let client = Arc::new(GrpcPeerClient::new(Duration::from_secs(2)));
    let store = Arc::new(Store::open(&config, &BackendRegistry::new(), client).unwrap());

    let router = build_server(store.clone());
    let addr = config.listen;
    tokio::spawn(async move {
        router.serve(addr).await.unwrap();
    });

    // Wait for server to be ready
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestNode {
        addr,
        store,
        _dir: dir,
    }
}

fn put_request(key: &str, value: &[u8], wait: bool) -> ringkv_proto::kv::PutRequest {
    ringkv_proto::kv::PutRequest {
        database: "users".to_string(),
        key: key.to_string(),
        value: value.to_vec(),
        wait,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_single_node_health() {
    let node = spawn_node("solo", 17300, &[]).await;

    let mut client = AdminServiceClient::connect(format!("http://{}", node.addr))
        .await
        .unwrap();
    let health = client
        .health(ringkv_proto::admin::HealthRequest {})
        .await
        .unwrap()
        .into_inner();

    assert!(health.healthy);
    assert_eq!(health.server_id, "solo");
}

#[tokio::test]
async fn test_single_node_put_get_remove() {
    let node = spawn_node("solo", 17310, &[]).await;
    let mut kv_client = KvServiceClient::connect(format!("http://{}", node.addr))
        .await
        .unwrap();

    let put = kv_client
        .put(put_request("hello", b"world", false))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(put.status_name, "done");
    assert!(put.version > 0);

    let get = kv_client
        .get(ringkv_proto::kv::GetRequest {
            database: "users".to_string(),
            key: "hello".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(get.found);
    let datum = get.datum.unwrap();
    assert_eq!(datum.value, b"world");
    assert_eq!(datum.version, put.version);

    // an older write is refused
    let mut stale = put_request("hello", b"old", false);
    stale.version = put.version - 1;
    let stale = kv_client.put(stale).await.unwrap().into_inner();
    assert_eq!(stale.status_name, "have");

    let removed = kv_client
        .remove(ringkv_proto::kv::RemoveRequest {
            database: "users".to_string(),
            key: "hello".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(removed.status_name, "done");

    let get = kv_client
        .get(ringkv_proto::kv::GetRequest {
            database: "users".to_string(),
            key: "hello".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!get.found);
}

#[tokio::test]
async fn test_unknown_database_is_not_found() {
    let node = spawn_node("solo", 17320, &[]).await;
    let mut kv_client = KvServiceClient::connect(format!("http://{}", node.addr))
        .await
        .unwrap();

    let mut req = put_request("k", b"v", false);
    req.database = "nope".to_string();
    let err = kv_client.put(req).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn test_two_node_replication() {
    let a = spawn_node("a", 17330, &[("b", 17331)]).await;
    let b = spawn_node("b", 17331, &[("a", 17330)]).await;
    a.store.probe_peers().await;
    b.store.probe_peers().await;
    assert!(a.store.registry().is_up("b"));

    let mut kv_a = KvServiceClient::connect(format!("http://{}", a.addr))
        .await
        .unwrap();
    let put = kv_a
        .put(put_request("shared", b"value", true))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(put.status_name, "done");
    assert!(put.replicas_confirmed >= 1);

    let mut kv_b = KvServiceClient::connect(format!("http://{}", b.addr))
        .await
        .unwrap();
    let get = kv_b
        .get(ringkv_proto::kv::GetRequest {
            database: "users".to_string(),
            key: "shared".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(get.found);
    assert_eq!(get.datum.unwrap().value, b"value");
}

#[tokio::test]
async fn test_admin_reconfigures_ring() {
    let node = spawn_node("solo", 17340, &[]).await;
    let mut admin = AdminServiceClient::connect(format!("http://{}", node.addr))
        .await
        .unwrap();

    let conf = admin
        .add_node(ringkv_proto::admin::AddNodeRequest {
            database: "users".to_string(),
            server: "solo".to_string(),
            shard: 0,
            slots: 0,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(conf.replicas, 2);
    assert_eq!(conf.shards, 1);

    let conf = admin
        .set_bits(ringkv_proto::admin::SetBitsRequest {
            database: "users".to_string(),
            bits: 6,
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(conf.ring_bits, 6);

    let err = admin
        .set_bits(ringkv_proto::admin::SetBitsRequest {
            database: "users".to_string(),
            bits: 17,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);

    let err = admin
        .add_node(ringkv_proto::admin::AddNodeRequest {
            database: "users".to_string(),
            server: "ghost".to_string(),
            shard: 5,
            slots: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);

    assert!(node.store.maintain_rings().await.unwrap() >= 1);
    let view = admin
        .ring_view(ringkv_proto::admin::RingViewRequest {
            database: "users".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(view.bits, 6);
    assert_eq!(view.partitions.len(), 64);
    assert!(view.partitions.iter().all(|p| p.local));
}
