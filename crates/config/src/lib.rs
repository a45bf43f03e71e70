//! Configuration schema and loader for ringkv nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This server's id, unique in the cluster.
    pub server_id: String,

    #[serde(default = "default_datacenter")]
    pub datacenter: String,

    #[serde(default = "default_rack")]
    pub rack: String,

    /// gRPC listen address.
    pub listen: SocketAddr,

    /// Statically known peers.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Hosted databases.
    #[serde(default = "default_databases")]
    pub databases: Vec<DatabaseConfig>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub merkle: MerkleConfig,

    #[serde(default)]
    pub anti_entropy: AntiEntropyConfig,

    #[serde(default)]
    pub distribute: DistributeConfig,

    #[serde(default)]
    pub expire: ExpireConfig,

    #[serde(default)]
    pub ring: RingConfig,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
    #[serde(default = "default_rack")]
    pub rack: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,

    /// Storage backend name; falls back to `storage.backend`.
    #[serde(default)]
    pub backend: Option<String>,

    /// Default TTL in seconds, 0 = keep forever.
    #[serde(default)]
    pub expire_secs: u64,

    /// Initial replica count; 0 disables partitioning.
    #[serde(default)]
    pub replicas: u32,

    /// Initial ring bits.
    #[serde(default)]
    pub ring_bits: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory; each database gets a subdirectory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Default backend: "memory" or "wal".
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: default_backend(),
            fsync: default_fsync(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleConfig {
    #[serde(default = "default_merkle_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_merkle_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_merkle_startup_delay_ms(),
            flush_interval_ms: default_merkle_flush_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropyConfig {
    /// Pause between cycles.
    #[serde(default = "default_ae_interval_ms")]
    pub interval_ms: u64,
    /// Extra pause after a cycle that found everything in sync.
    #[serde(default = "default_ae_idle_extra_ms")]
    pub idle_extra_ms: u64,
    /// Maximum concurrent workers per (partition, peer) pass.
    #[serde(default = "default_ae_workers")]
    pub workers: usize,
    /// Delay before the second worker starts; doubles for each later one.
    #[serde(default = "default_ae_worker_start_delay_ms")]
    pub worker_start_delay_ms: u64,
    /// Keys per batched GET.
    #[serde(default = "default_ae_batch_size")]
    pub batch_size: usize,
    /// `max_result` sent with CHECK requests.
    #[serde(default = "default_ae_check_max_result")]
    pub check_max_result: usize,
    /// Versions newer than this many seconds are left to replication.
    #[serde(default = "default_ae_too_new_secs")]
    pub too_new_secs: u64,
    /// Failed requests tolerated per pass.
    #[serde(default = "default_ae_max_errors")]
    pub max_errors: usize,
    #[serde(default = "default_ae_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AntiEntropyConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_ae_interval_ms(),
            idle_extra_ms: default_ae_idle_extra_ms(),
            workers: default_ae_workers(),
            worker_start_delay_ms: default_ae_worker_start_delay_ms(),
            batch_size: default_ae_batch_size(),
            check_max_result: default_ae_check_max_result(),
            too_new_secs: default_ae_too_new_secs(),
            max_errors: default_ae_max_errors(),
            timeout_ms: default_ae_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeConfig {
    #[serde(default = "default_max_hop")]
    pub max_hop: u32,
    #[serde(default = "default_max_try")]
    pub max_try: u32,
    #[serde(default = "default_distribute_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DistributeConfig {
    fn default() -> Self {
        Self {
            max_hop: default_max_hop(),
            max_try: default_max_try(),
            timeout_ms: default_distribute_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpireConfig {
    #[serde(default = "default_expire_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_expire_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ExpireConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_expire_startup_delay_ms(),
            interval_ms: default_expire_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// How often `_conf` is polled for a newer configuration.
    #[serde(default = "default_ring_maint_interval_ms")]
    pub maint_interval_ms: u64,
    /// A configuration younger than this is not applied over an existing
    /// table, so bursts of admin changes land as one reconfigure.
    #[serde(default = "default_ring_settle_secs")]
    pub settle_secs: u64,
    /// Repartitioner sleep once every partition is stable.
    #[serde(default = "default_repartition_idle_ms")]
    pub repartition_idle_ms: u64,
    /// Liveness probe period.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            maint_interval_ms: default_ring_maint_interval_ms(),
            settle_secs: default_ring_settle_secs(),
            repartition_idle_ms: default_repartition_idle_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

// --- Defaults ---

fn default_datacenter() -> String {
    "default".to_string()
}
fn default_rack() -> String {
    "default".to_string()
}
fn default_databases() -> Vec<DatabaseConfig> {
    vec![DatabaseConfig {
        name: "default".to_string(),
        backend: None,
        expire_secs: 0,
        replicas: 0,
        ring_bits: 0,
    }]
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_backend() -> String {
    "wal".to_string()
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_merkle_startup_delay_ms() -> u64 {
    10_000
}
fn default_merkle_flush_interval_ms() -> u64 {
    5_000
}
fn default_ae_interval_ms() -> u64 {
    5_000
}
fn default_ae_idle_extra_ms() -> u64 {
    25_000
}
fn default_ae_workers() -> usize {
    4
}
fn default_ae_worker_start_delay_ms() -> u64 {
    50
}
fn default_ae_batch_size() -> usize {
    64
}
fn default_ae_check_max_result() -> usize {
    256
}
fn default_ae_too_new_secs() -> u64 {
    60
}
fn default_ae_max_errors() -> usize {
    20
}
fn default_ae_timeout_ms() -> u64 {
    30_000
}
fn default_max_hop() -> u32 {
    5
}
fn default_max_try() -> u32 {
    3
}
fn default_distribute_timeout_ms() -> u64 {
    15_000
}
fn default_expire_startup_delay_ms() -> u64 {
    30_000
}
fn default_expire_interval_ms() -> u64 {
    60_000
}
fn default_ring_maint_interval_ms() -> u64 {
    15_000
}
fn default_ring_settle_secs() -> u64 {
    120
}
fn default_repartition_idle_ms() -> u64 {
    30_000
}
fn default_probe_interval_ms() -> u64 {
    5_000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Name of the reserved database holding ring configurations.
pub const CONF_DATABASE: &str = "_conf";

impl NodeConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.is_empty() {
            return Err(ConfigError::Invalid("server_id must not be empty".into()));
        }
        let mut names = HashSet::new();
        for db in &self.databases {
            if db.name.is_empty() {
                return Err(ConfigError::Invalid("databases.name must not be empty".into()));
            }
            if db.name == CONF_DATABASE {
                return Err(ConfigError::Invalid(format!(
                    "databases.name {} is reserved",
                    CONF_DATABASE
                )));
            }
            if !names.insert(db.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "databases.name {} is listed twice",
                    db.name
                )));
            }
            if db.ring_bits > 16 {
                return Err(ConfigError::Invalid(format!(
                    "databases.ring_bits ({}) must be <= 16",
                    db.ring_bits
                )));
            }
        }
        if self.anti_entropy.workers == 0 {
            return Err(ConfigError::Invalid(
                "anti_entropy.workers must be > 0".into(),
            ));
        }
        if self.anti_entropy.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "anti_entropy.batch_size must be > 0".into(),
            ));
        }
        if self.peers.iter().any(|p| p.id == self.server_id) {
            return Err(ConfigError::Invalid(
                "peers must not contain this server's own id".into(),
            ));
        }
        Ok(())
    }

    /// Backend for a database, falling back to the storage default.
    pub fn backend_for<'a>(&'a self, db: &'a DatabaseConfig) -> &'a str {
        db.backend.as_deref().unwrap_or(&self.storage.backend)
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
