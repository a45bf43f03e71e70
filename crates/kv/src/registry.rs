//! Explicit registry of every server this node knows about.
//!
//! Built once at startup and handed to the rings, the distributor and the
//! anti-entropy driver. Liveness gossip is not done here: whoever learns a
//! peer's state (the status probe, a test) calls [`ServerRegistry::set_status`].

use parking_lot::RwLock;
use ringkv_common::ServerInfo;
use std::collections::HashMap;

#[derive(Debug)]
pub struct ServerRegistry {
    local_id: String,
    servers: RwLock<HashMap<String, ServerInfo>>,
}

impl ServerRegistry {
    /// Create a registry containing only the local server, marked up.
    pub fn new(mut local: ServerInfo) -> Self {
        local.up = true;
        local.available = true;
        let local_id = local.id.clone();
        let mut servers = HashMap::new();
        servers.insert(local_id.clone(), local);
        Self {
            local_id,
            servers: RwLock::new(servers),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local(&self) -> ServerInfo {
        self.servers
            .read()
            .get(&self.local_id)
            .cloned()
            .unwrap_or_else(|| ServerInfo::new(self.local_id.clone(), "", "", ""))
    }

    pub fn is_local(&self, id: &str) -> bool {
        id == self.local_id
    }

    /// Insert or replace a server description. The local entry keeps its
    /// liveness flags.
    pub fn upsert(&self, mut info: ServerInfo) {
        let mut servers = self.servers.write();
        if info.id == self.local_id {
            if let Some(me) = servers.get(&self.local_id) {
                info.up = true;
                info.available = true;
                info.uptodate = me.uptodate;
            }
        }
        servers.insert(info.id.clone(), info);
    }

    /// Make sure `id` is known, recording its placement. New entries start
    /// down with no address until a probe or the operator fills them in.
    pub fn ensure(&self, id: &str, datacenter: &str, rack: &str) {
        let mut servers = self.servers.write();
        match servers.get_mut(id) {
            Some(s) => {
                s.datacenter = datacenter.to_string();
                s.rack = rack.to_string();
            }
            None => {
                servers.insert(id.to_string(), ServerInfo::new(id, datacenter, rack, ""));
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<ServerInfo> {
        self.servers.read().get(id).cloned()
    }

    /// Every known server, ordered by datacenter, rack, then id.
    pub fn all(&self) -> Vec<ServerInfo> {
        let mut all: Vec<ServerInfo> = self.servers.read().values().cloned().collect();
        all.sort_by(|a, b| {
            (&a.datacenter, &a.rack, &a.id).cmp(&(&b.datacenter, &b.rack, &b.id))
        });
        all
    }

    /// Every known server except this one.
    pub fn peers(&self) -> Vec<ServerInfo> {
        self.all()
            .into_iter()
            .filter(|s| s.id != self.local_id)
            .collect()
    }

    /// Record a peer's liveness. Ignored for the local server and for
    /// unknown ids.
    pub fn set_status(&self, id: &str, up: bool, uptodate: bool) {
        if id == self.local_id {
            return;
        }
        if let Some(s) = self.servers.write().get_mut(id) {
            s.up = up;
            s.available = up;
            s.uptodate = up && uptodate;
        }
    }

    pub fn set_local_uptodate(&self, uptodate: bool) {
        if let Some(me) = self.servers.write().get_mut(&self.local_id) {
            me.uptodate = uptodate;
        }
    }

    pub fn set_config_version(&self, id: &str, version: u64) {
        if let Some(s) = self.servers.write().get_mut(id) {
            s.last_config_version = s.last_config_version.max(version);
        }
    }

    pub fn is_up(&self, id: &str) -> bool {
        self.servers.read().get(id).is_some_and(ServerInfo::is_up)
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}
