//! Conversions between proto types and domain types.

use ringkv_common::{Datum, KeyVersion, PutStatus, ServerInfo};
use ringkv_kv::distrib::DistRequest;
use ringkv_kv::merkle::{CheckItem, LeafEntry, NodeSummary, HASH_LEN};
use ringkv_kv::peer_client::CheckRequest;
use ringkv_kv::ring_conf::RingConf;
use ringkv_proto::{admin as pa, common as pb, peer as pp};

// ---------------------------------------------------------------------------
// ServerInfo
// ---------------------------------------------------------------------------

pub fn server_to_proto(info: &ServerInfo) -> pb::ServerInfo {
    pb::ServerInfo {
        id: info.id.clone(),
        datacenter: info.datacenter.clone(),
        rack: info.rack.clone(),
        address: info.address.clone(),
        up: info.up,
        available: info.available,
        uptodate: info.uptodate,
        last_config_version: info.last_config_version,
    }
}

pub fn server_from_proto(proto: pb::ServerInfo) -> ServerInfo {
    ServerInfo {
        id: proto.id,
        datacenter: proto.datacenter,
        rack: proto.rack,
        address: proto.address,
        up: proto.up,
        available: proto.available,
        uptodate: proto.uptodate,
        last_config_version: proto.last_config_version,
    }
}

// ---------------------------------------------------------------------------
// Datum / KeyVersion
// ---------------------------------------------------------------------------

pub fn datum_to_proto(d: &Datum) -> pb::Datum {
    pb::Datum {
        key: d.key.clone(),
        value: d.value.clone().unwrap_or_default(),
        tombstone: d.value.is_none(),
        version: d.version,
        has_shard: d.shard.is_some(),
        shard: d.shard.unwrap_or_default(),
        expire: d.expire,
        program: d.program.clone().unwrap_or_default(),
    }
}

pub fn datum_from_proto(proto: pb::Datum) -> Datum {
    Datum {
        key: proto.key,
        value: (!proto.tombstone).then_some(proto.value),
        version: proto.version,
        shard: proto.has_shard.then_some(proto.shard),
        expire: proto.expire,
        program: (!proto.program.is_empty()).then_some(proto.program),
    }
}

pub fn key_version_to_proto(kv: &KeyVersion) -> pb::KeyVersion {
    pb::KeyVersion {
        key: kv.key.clone(),
        version: kv.version,
    }
}

pub fn key_version_from_proto(proto: pb::KeyVersion) -> KeyVersion {
    KeyVersion {
        key: proto.key,
        version: proto.version,
    }
}

// ---------------------------------------------------------------------------
// CHECK
// ---------------------------------------------------------------------------

pub fn check_request_to_proto(req: &CheckRequest) -> pp::CheckRequest {
    pp::CheckRequest {
        database: req.database.clone(),
        level: req.level,
        tree_id: u32::from(req.tree_id),
        version: req.version,
        max_result: u32::try_from(req.max_result).unwrap_or(u32::MAX),
    }
}

pub fn check_request_from_proto(proto: pp::CheckRequest) -> Result<CheckRequest, tonic::Status> {
    let tree_id = u16::try_from(proto.tree_id)
        .map_err(|_| tonic::Status::invalid_argument(format!("tree id {} out of range", proto.tree_id)))?;
    Ok(CheckRequest {
        database: proto.database,
        level: proto.level,
        tree_id,
        version: proto.version,
        max_result: proto.max_result as usize,
    })
}

pub fn check_item_to_proto(item: &CheckItem) -> pp::CheckItem {
    let inner = match item {
        CheckItem::Node(n) => pp::check_item::Item::Node(pp::NodeSummary {
            level: n.level,
            version: n.version,
            tree_id: u32::from(n.tree_id),
            children: n.children,
            keycount: n.keycount,
            hash: n.hash.to_vec(),
            valid: n.valid,
        }),
        CheckItem::Key(e) => pp::check_item::Item::Key(pp::LeafEntry {
            key: e.key.clone(),
            version: e.version,
            shard: e.shard,
        }),
    };
    pp::CheckItem { item: Some(inner) }
}

/// Replies come from peers; a malformed item is an error, not a panic.
pub fn check_item_from_proto(proto: pp::CheckItem) -> Result<CheckItem, String> {
    match proto.item {
        Some(pp::check_item::Item::Node(n)) => {
            let hash: [u8; HASH_LEN] = n
                .hash
                .as_slice()
                .try_into()
                .map_err(|_| format!("node hash must be {} bytes, got {}", HASH_LEN, n.hash.len()))?;
            let tree_id = u16::try_from(n.tree_id).map_err(|_| format!("tree id {} out of range", n.tree_id))?;
            Ok(CheckItem::Node(NodeSummary {
                level: n.level,
                version: n.version,
                tree_id,
                children: n.children,
                keycount: n.keycount,
                hash,
                valid: n.valid,
            }))
        }
        Some(pp::check_item::Item::Key(e)) => Ok(CheckItem::Key(LeafEntry::new(e.key, e.version, e.shard))),
        None => Err("empty check item".to_string()),
    }
}

// ---------------------------------------------------------------------------
// DIST
// ---------------------------------------------------------------------------

pub fn dist_request_to_proto(req: &DistRequest) -> pp::DistRequest {
    pp::DistRequest {
        database: req.database.clone(),
        hop: req.hop,
        deadline: req.deadline,
        sender: req.sender.clone().unwrap_or_default(),
        datum: Some(datum_to_proto(&req.datum)),
    }
}

pub fn dist_request_from_proto(proto: pp::DistRequest) -> Result<DistRequest, tonic::Status> {
    let datum = proto
        .datum
        .ok_or_else(|| tonic::Status::invalid_argument("missing datum"))?;
    Ok(DistRequest {
        database: proto.database,
        hop: proto.hop,
        deadline: proto.deadline,
        sender: (!proto.sender.is_empty()).then_some(proto.sender),
        datum: datum_from_proto(datum),
    })
}

pub fn status_to_proto(status: PutStatus) -> pp::DistResponse {
    pp::DistResponse {
        status: status.code(),
    }
}

// ---------------------------------------------------------------------------
// Ring configuration
// ---------------------------------------------------------------------------

pub fn ring_conf_to_proto(conf: &RingConf) -> pa::RingConfResponse {
    pa::RingConfResponse {
        version: conf.version,
        replicas: conf.replicas,
        ring_bits: conf.ring_bits,
        shards: u32::try_from(conf.shard_count()).unwrap_or(u32::MAX),
    }
}
