//! In-process transport: a [`PeerClient`] that calls other nodes'
//! [`PeerHandler`]s directly. Used to run a whole cluster inside one test.

use crate::distrib::DistRequest;
use crate::merkle::CheckItem;
use crate::peer_client::{CheckRequest, PeerClient, PeerError, PeerHandler};
use parking_lot::RwLock;
use ringkv_common::{Datum, KeyVersion, PutStatus, ServerInfo};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Server id -> handler. Handlers are held weakly; a node that has been
/// dropped looks like one that is down.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<String, Weak<dyn PeerHandler>>>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<String> = self.handlers.read().keys().cloned().collect();
        ids.sort();
        f.debug_struct("LocalNetwork").field("servers", &ids).finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<H: PeerHandler>(&self, id: &str, handler: &Arc<H>) {
        let weak: Weak<dyn PeerHandler> = Arc::downgrade(handler) as Weak<dyn PeerHandler>;
        self.handlers.write().insert(id.to_string(), weak);
    }

    pub fn unregister(&self, id: &str) {
        self.handlers.write().remove(id);
    }

    pub fn client(self: &Arc<Self>) -> LocalPeerClient {
        LocalPeerClient {
            network: self.clone(),
        }
    }

    fn handler(&self, id: &str) -> Result<Arc<dyn PeerHandler>, PeerError> {
        self.handlers
            .read()
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| PeerError::RpcFailed(format!("no route to {}", id)))
    }
}

#[derive(Debug, Clone)]
pub struct LocalPeerClient {
    network: Arc<LocalNetwork>,
}

#[async_trait::async_trait]
impl PeerClient for LocalPeerClient {
    async fn check(&self, target: &ServerInfo, req: &CheckRequest) -> Result<Vec<CheckItem>, PeerError> {
        self.network.handler(&target.id)?.handle_check(req).await
    }

    async fn get(&self, target: &ServerInfo, database: &str, keys: &[KeyVersion]) -> Result<Vec<Datum>, PeerError> {
        self.network
            .handler(&target.id)?
            .handle_get(database, keys)
            .await
    }

    async fn distribute(&self, target: &ServerInfo, req: &DistRequest) -> Result<PutStatus, PeerError> {
        self.network
            .handler(&target.id)?
            .handle_dist(req.clone())
            .await
    }

    async fn status(&self, target: &ServerInfo) -> Result<ServerInfo, PeerError> {
        Ok(self.network.handler(&target.id)?.handle_status())
    }
}
