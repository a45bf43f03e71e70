//! Generated gRPC code for the ringkv protobuf definitions.

/// Shared messages (ServerInfo, Datum, KeyVersion).
pub mod common {
    tonic::include_proto!("ringkv.common");
}

/// Server-to-server service (Check, Get, Distribute, Status).
pub mod peer {
    tonic::include_proto!("ringkv.peer");
}

/// Client service (Put, Get, Remove).
pub mod kv {
    tonic::include_proto!("ringkv.kv");
}

/// Operator service (Health, RingView, ring configuration).
pub mod admin {
    tonic::include_proto!("ringkv.admin");
}
