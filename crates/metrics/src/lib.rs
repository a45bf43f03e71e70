//! Metrics and tracing setup for ringkv.
//!
//! One process-wide [`NodeMetrics`] registry that the storage, replication
//! and ring code bump directly, and a small hyper server that exposes it
//! for scraping on `/metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Filter used when `RUST_LOG` is unset. The transport crates are chatty at
/// info.
const DEFAULT_LOG_FILTER: &str = "info,h2=warn,hyper=warn,tower=warn";

/// Install the global fmt subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ---------------------------------------------------------------------------
// Prometheus metrics
// ---------------------------------------------------------------------------

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// The process-wide metrics, registered on first use.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a ringkv node.
pub struct NodeMetrics {
    pub registry: Registry,

    // Peer RPCs
    pub rpcs_sent_by_type: IntCounterVec,
    pub rpcs_received_by_type: IntCounterVec,
    pub rpc_errors_by_type: IntCounterVec,
    pub rpc_latency_secs: HistogramVec,

    // Read/write path
    pub puts_by_status: IntCounterVec,
    pub gets: IntCounter,
    pub removes: IntCounter,

    // Replication
    pub distrib_sent: IntCounter,
    pub distrib_errors: IntCounter,
    pub distrib_seen: IntCounter,
    pub distrib_dropped: IntCounter,

    // Anti-entropy
    pub ae_passes: IntCounter,
    pub ae_fetched: IntCounter,
    pub ae_errors: IntCounter,
    pub ae_tree_repairs: IntCounter,

    // Ring
    pub reconfigures: IntCounter,
    pub repart_moved: IntCounter,
    pub repart_relocated: IntCounter,

    // Merkle / expiry
    pub merkle_changes_applied: IntCounter,
    pub merkle_fixes: IntCounter,
    pub expired_keys: IntCounter,
}

impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Peer RPC latency buckets, in seconds.
const RPC_BUCKETS: &[f64] = &[0.0005, 0.002, 0.01, 0.05, 0.25, 1.0, 5.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("counter registered once");
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts");
    registry
        .register(Box::new(c.clone()))
        .expect("counter vec registered once");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let opts = HistogramOpts::new(name, help).buckets(RPC_BUCKETS.to_vec());
    let h = HistogramVec::new(opts, labels).expect("valid histogram opts");
    registry
        .register(Box::new(h.clone()))
        .expect("histogram registered once");
    h
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();
        let r = &registry;

        let rpc_latency_secs = histogram_vec(
            r,
            "ringkv_rpc_latency_seconds",
            "Peer RPC latency in seconds, by type and direction",
            &["rpc_type", "direction"],
        );

        Self {
            rpcs_sent_by_type: counter_vec(
                r,
                "ringkv_rpcs_sent_total",
                "Outbound peer RPCs, by type",
                &["rpc_type"],
            ),
            rpcs_received_by_type: counter_vec(
                r,
                "ringkv_rpcs_received_total",
                "Inbound peer RPCs, by type",
                &["rpc_type"],
            ),
            rpc_errors_by_type: counter_vec(
                r,
                "ringkv_rpc_errors_total",
                "Failed or timed out outbound peer RPCs, by type",
                &["rpc_type"],
            ),
            rpc_latency_secs,
            puts_by_status: counter_vec(
                r,
                "ringkv_puts_total",
                "Local writes, by result",
                &["status"],
            ),
            gets: counter(r, "ringkv_gets_total", "Local reads"),
            removes: counter(r, "ringkv_removes_total", "Physical record removals"),
            distrib_sent: counter(r, "ringkv_distrib_sent_total", "DIST requests sent"),
            distrib_errors: counter(
                r,
                "ringkv_distrib_errors_total",
                "DIST requests that failed at the transport",
            ),
            distrib_seen: counter(
                r,
                "ringkv_distrib_seen_total",
                "DIST replies saying the peer already had the write",
            ),
            distrib_dropped: counter(
                r,
                "ringkv_distrib_dropped_total",
                "DIST requests dropped for hop count or expiry",
            ),
            ae_passes: counter(r, "ringkv_ae_passes_total", "Anti-entropy partition passes"),
            ae_fetched: counter(r, "ringkv_ae_fetched_total", "Keys fetched by anti-entropy"),
            ae_errors: counter(r, "ringkv_ae_errors_total", "Anti-entropy request failures"),
            ae_tree_repairs: counter(
                r,
                "ringkv_ae_tree_repairs_total",
                "Local Merkle leaves re-added by anti-entropy",
            ),
            reconfigures: counter(r, "ringkv_reconfigures_total", "Ring tables installed"),
            repart_moved: counter(
                r,
                "ringkv_repart_moved_total",
                "Keys handed off to new owners while repartitioning",
            ),
            repart_relocated: counter(
                r,
                "ringkv_repart_relocated_total",
                "Keys moved between local Merkle trees while repartitioning",
            ),
            merkle_changes_applied: counter(
                r,
                "ringkv_merkle_changes_applied_total",
                "Merkle node read-modify-writes performed by the flusher",
            ),
            merkle_fixes: counter(r, "ringkv_merkle_fixes_total", "Merkle integrity repairs"),
            expired_keys: counter(r, "ringkv_expired_keys_total", "Keys removed by expiry"),
            registry,
        }
    }
}

/// Every registered series in the Prometheus text format.
pub fn encode_metrics() -> String {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metrics().registry.gather(), &mut buf) {
        tracing::warn!("prometheus text encoding failed: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start an RPC latency timer. Returns a guard that records elapsed time
/// on drop.
pub fn start_rpc_timer(rpc_type: &str, direction: &str) -> prometheus::HistogramTimer {
    metrics()
        .rpc_latency_secs
        .with_label_values(&[rpc_type, direction])
        .start_timer()
}

// ---------------------------------------------------------------------------
// Metrics HTTP server
// ---------------------------------------------------------------------------

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

const METRICS_PATH: &str = "/metrics";

/// The reply for `path`: the exposition text on `/metrics`, 404 elsewhere.
fn respond(path: &str) -> Response<Full<Bytes>> {
    let (status, body) = if path == METRICS_PATH {
        (StatusCode::OK, encode_metrics())
    } else {
        (StatusCode::NOT_FOUND, String::from("not found\n"))
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    response
}

/// Serve Prometheus metrics on `addr` until the listener fails.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics on http://{}{}", addr, METRICS_PATH);

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                Ok::<_, std::convert::Infallible>(respond(req.uri().path()))
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("metrics connection from {} failed: {}", peer, e);
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
