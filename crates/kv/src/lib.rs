//! The ringkv core: a partitioned, replicated, eventually-consistent
//! key-value layer.
//!
//! Keys hash onto a consistent-hash [`ring`]; every database keeps a
//! write-time indexed [`merkle`] tree that [`anti_entropy`] compares
//! against peers, while the [`distrib`] fan-out pushes each write to its
//! replicas. [`store::Store`] ties the databases of one node together.

pub mod anti_entropy;
pub mod chaos;
pub mod database;
pub mod distrib;
pub mod expire;
pub mod local;
pub mod merkle;
pub mod peer_client;
pub mod registry;
pub mod repartition;
pub mod ring;
pub mod ring_conf;
pub mod store;

pub use database::{Database, DbError, Transform, TransformError};
pub use peer_client::{CheckRequest, PeerClient, PeerError, PeerHandler};
pub use registry::ServerRegistry;
pub use ring::Ring;
pub use ring_conf::RingConf;
pub use store::{PutReply, Store, StoreError};
