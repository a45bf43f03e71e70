//! The ring configuration record stored in the `_conf` database.

use serde::{Deserialize, Serialize};

/// One server's explicit shard assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerShards {
    pub id: String,
    pub datacenter: String,
    pub rack: String,
    #[serde(default)]
    pub shards: Vec<u32>,
}

/// Desired layout of one database's ring.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RingConf {
    /// Microsecond timestamp of the last change.
    pub version: u64,
    /// 0 disables partitioning: every server holds everything.
    pub replicas: u32,
    pub ring_bits: u32,
    #[serde(default)]
    pub servers: Vec<ServerShards>,
}

impl RingConf {
    pub fn encode(&self) -> Vec<u8> {
        // a plain struct of strings and integers always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Total number of explicit assignments.
    pub fn shard_count(&self) -> usize {
        self.servers.iter().map(|s| s.shards.len()).sum()
    }

    pub fn server(&self, id: &str) -> Option<&ServerShards> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn server_mut(&mut self, id: &str) -> Option<&mut ServerShards> {
        self.servers.iter_mut().find(|s| s.id == id)
    }
}
