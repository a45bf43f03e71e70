//! Push replication of single writes.
//!
//! A write fans out in up to three tiers: `nearby` (local datacenter
//! replicas), `midway` (other racks of the local datacenter, unpartitioned
//! rings only) and `faraway` (one server per remote datacenter, first hop
//! only). Each tier walks its target list one server at a time, retrying
//! transport failures and deciding from each reply whether to continue.

use crate::peer_client::PeerClient;
use crate::registry::ServerRegistry;
use crate::ring::Ring;
use rand::seq::SliceRandom;
use rand::Rng;
use ringkv_common::{now_micros, Datum, PutStatus, ServerInfo};
use ringkv_config::DistributeConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Starting hop for repartition hand-offs: past the ceiling, so receivers
/// store the record but never forward it.
pub const MIGRATE_HOP: u32 = 10;
/// Lifetime of a repartition hand-off, in microseconds.
pub const MIGRATE_TTL: u64 = 10_000_000;

/// One DIST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistRequest {
    pub database: String,
    pub hop: u32,
    /// Drop the request after this time (µs), 0 = never.
    pub deadline: u64,
    /// Who forwarded it; `None` for a hand-off that starts here.
    pub sender: Option<String>,
    pub datum: Datum,
}

impl DistRequest {
    pub fn new(database: &str, datum: Datum) -> Self {
        Self {
            database: database.to_string(),
            hop: 0,
            deadline: 0,
            sender: None,
            datum,
        }
    }

    /// A repartition hand-off of `datum`.
    pub fn migration(database: &str, datum: Datum) -> Self {
        Self {
            hop: MIGRATE_HOP,
            deadline: now_micros() + MIGRATE_TTL,
            ..Self::new(database, datum)
        }
    }
}

/// One list of targets walked in order.
#[derive(Debug, Clone)]
pub struct Tier {
    pub name: &'static str,
    pub targets: VecDeque<ServerInfo>,
    /// "Already had it" replies tolerated before giving up.
    pub max_seen: u32,
}

#[derive(Debug, Clone)]
pub struct DistPlan {
    /// The request as forwarded: hop incremented, sender set to us.
    pub request: DistRequest,
    /// Keep sending until peers report having it (replication), rather
    /// than stopping at the first confirmation (hand-off).
    pub keep_going: bool,
    pub tiers: Vec<Tier>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierReport {
    pub tier: &'static str,
    pub sent: u32,
    pub confirmed: u32,
}

pub struct Distributor<C: PeerClient> {
    registry: Arc<ServerRegistry>,
    client: Arc<C>,
    config: DistributeConfig,
}

impl<C: PeerClient> std::fmt::Debug for Distributor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: PeerClient> Distributor<C> {
    pub fn new(registry: Arc<ServerRegistry>, client: Arc<C>, config: DistributeConfig) -> Self {
        Self {
            registry,
            client,
            config,
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Decide where `req` goes for partition `part`. `None` when the
    /// request is dropped for its hop count or deadline.
    pub fn plan(&self, ring: &Ring, part: usize, req: &DistRequest) -> Option<DistPlan> {
        if req.sender.is_some() && req.hop > self.config.max_hop {
            ringkv_metrics::metrics().distrib_dropped.inc();
            return None;
        }
        if req.deadline != 0 && req.deadline < now_micros() {
            ringkv_metrics::metrics().distrib_dropped.inc();
            return None;
        }

        let local = self.registry.local();
        let (keep_going, orderly, send_far) = match &req.sender {
            Some(sender) => {
                let from_far = self
                    .registry
                    .get(sender)
                    .is_some_and(|s| s.datacenter != local.datacenter);
                (
                    true,
                    req.hop > 1 || (req.hop == 1 && !from_far),
                    req.hop == 0,
                )
            }
            None => (false, false, false),
        };

        let mut request = req.clone();
        request.hop += 1;
        request.sender = Some(local.id.clone());

        let usable = |id: &str| -> Option<ServerInfo> {
            if self.registry.is_local(id) || req.sender.as_deref() == Some(id) {
                return None;
            }
            self.registry.get(id).filter(ServerInfo::is_up)
        };

        let mut tiers = Vec::new();
        match ring.partition(part) {
            Some(p) => {
                let max_seen = if ring.replicas() < 4 { 1 } else { 2 };
                let local_dc: &[String] = p.dcs.first().map_or(&[], |d| d.servers.as_slice());
                let mut nearby = ordered(local_dc, &local.id, orderly, &usable);

                if send_far {
                    let far: VecDeque<ServerInfo> =
                        p.dcs.iter().skip(1).filter_map(|d| pick_one(&d.servers, &usable)).collect();
                    push_tier(&mut tiers, "faraway", far, 2);
                } else if req.sender.is_none() && nearby.is_empty() {
                    // a hand-off whose new owners are all remote
                    let remote: Vec<String> =
                        p.dcs.iter().skip(1).flat_map(|d| d.servers.iter().cloned()).collect();
                    nearby = ordered(&remote, &local.id, false, &usable);
                }
                push_tier(&mut tiers, "nearby", nearby, max_seen);
            }
            None => {
                let all = self.registry.all();
                let same_rack: Vec<String> = all
                    .iter()
                    .filter(|s| s.datacenter == local.datacenter && s.rack == local.rack)
                    .map(|s| s.id.clone())
                    .collect();
                let nearby = ordered(&same_rack, &local.id, orderly, &usable);

                // one server per other rack of this datacenter
                let mut racks: Vec<Vec<String>> = Vec::new();
                let mut last_rack: Option<&str> = None;
                for s in all
                    .iter()
                    .filter(|s| s.datacenter == local.datacenter && s.rack != local.rack)
                {
                    if last_rack != Some(s.rack.as_str()) {
                        racks.push(Vec::new());
                        last_rack = Some(s.rack.as_str());
                    }
                    if let Some(group) = racks.last_mut() {
                        group.push(s.id.clone());
                    }
                }
                let mut midway: VecDeque<ServerInfo> =
                    racks.iter().filter_map(|group| pick_one(group, &usable)).collect();
                if !orderly {
                    midway.make_contiguous().shuffle(&mut rand::thread_rng());
                }

                if send_far {
                    let mut dcs: Vec<Vec<String>> = Vec::new();
                    let mut last_dc: Option<&str> = None;
                    for s in all.iter().filter(|s| s.datacenter != local.datacenter) {
                        if last_dc != Some(s.datacenter.as_str()) {
                            dcs.push(Vec::new());
                            last_dc = Some(s.datacenter.as_str());
                        }
                        if let Some(group) = dcs.last_mut() {
                            group.push(s.id.clone());
                        }
                    }
                    let far = dcs.iter().filter_map(|group| pick_one(group, &usable)).collect();
                    push_tier(&mut tiers, "faraway", far, 2);
                }
                push_tier(&mut tiers, "midway", midway, 2);
                push_tier(&mut tiers, "nearby", nearby, 2);
            }
        }

        Some(DistPlan {
            request,
            keep_going,
            tiers,
        })
    }

    /// Plan and start sending. Each tier runs as its own task.
    pub fn distribute(&self, ring: &Ring, part: usize, req: &DistRequest) -> Vec<JoinHandle<TierReport>> {
        let Some(plan) = self.plan(ring, part, req) else {
            return Vec::new();
        };
        let request = Arc::new(plan.request);
        plan.tiers
            .into_iter()
            .map(|tier| {
                let client = self.client.clone();
                let request = request.clone();
                let config = self.config.clone();
                tokio::spawn(run_tier(client, tier, request, plan.keep_going, config))
            })
            .collect()
    }

    /// [`Self::distribute`], then wait for every tier to finish.
    pub async fn distribute_and_wait(&self, ring: &Ring, part: usize, req: &DistRequest) -> Vec<TierReport> {
        futures::future::join_all(self.distribute(ring, part, req))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }
}

fn push_tier(tiers: &mut Vec<Tier>, name: &'static str, targets: VecDeque<ServerInfo>, max_seen: u32) {
    if !targets.is_empty() {
        tiers.push(Tier {
            name,
            targets,
            max_seen,
        });
    }
}

/// Usable servers of `ids`. Orderly lists start just past `local_id` and
/// wrap around, so every server walks the ring the same way; otherwise the
/// list is shuffled.
fn ordered(
    ids: &[String],
    local_id: &str,
    orderly: bool,
    usable: &dyn Fn(&str) -> Option<ServerInfo>,
) -> VecDeque<ServerInfo> {
    if orderly {
        let split = ids.iter().position(|id| id == local_id).map_or(0, |i| i + 1);
        ids[split..]
            .iter()
            .chain(&ids[..split])
            .filter_map(|id| usable(id))
            .collect()
    } else {
        let mut list: Vec<ServerInfo> = ids.iter().filter_map(|id| usable(id)).collect();
        list.shuffle(&mut rand::thread_rng());
        list.into()
    }
}

/// A random usable server from `ids`.
fn pick_one(ids: &[String], usable: &dyn Fn(&str) -> Option<ServerInfo>) -> Option<ServerInfo> {
    if ids.is_empty() {
        return None;
    }
    let start = rand::thread_rng().gen_range(0..ids.len());
    (0..ids.len()).find_map(|i| usable(&ids[(start + i) % ids.len()]))
}

/// Walk one tier: retry the current target on transport errors, then
/// decide from the reply whether to move on.
async fn run_tier<C: PeerClient>(
    client: Arc<C>,
    mut tier: Tier,
    request: Arc<DistRequest>,
    keep_going: bool,
    config: DistributeConfig,
) -> TierReport {
    let m = ringkv_metrics::metrics();
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut report = TierReport {
        tier: tier.name,
        ..Default::default()
    };
    let mut max_seen = tier.max_seen;
    let mut retries = 0;
    let mut current = tier.targets.pop_front();

    while let Some(target) = current.take() {
        report.sent += 1;
        m.distrib_sent.inc();
        let result = match tokio::time::timeout(timeout, client.distribute(&target, &request)).await {
            Ok(r) => r.map_err(|e| e.to_string()),
            Err(_) => Err("timeout".to_string()),
        };

        match result {
            Ok(status) => {
                retries = 0;
                if keep_going {
                    if status == PutStatus::Done {
                        report.confirmed += 1;
                        current = tier.targets.pop_front();
                    } else {
                        max_seen = max_seen.saturating_sub(1);
                        if max_seen > 0 {
                            m.distrib_seen.inc();
                            // others are already spreading it; skip ahead
                            for _ in 0..=request.hop {
                                if tier.targets.len() > 1 {
                                    tier.targets.pop_front();
                                }
                            }
                            current = tier.targets.pop_front();
                        }
                    }
                } else if matches!(status, PutStatus::Done | PutStatus::Have) {
                    report.confirmed += 1;
                } else {
                    current = tier.targets.pop_front();
                }
            }
            Err(e) => {
                m.distrib_errors.inc();
                tracing::debug!(
                    "distribute {:?} to {} ({}) failed: {}",
                    request.datum.key,
                    target.id,
                    tier.name,
                    e
                );
                retries += 1;
                if retries > config.max_try {
                    retries = 0;
                    current = tier.targets.pop_front();
                } else {
                    current = Some(target);
                }
            }
        }
    }
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
