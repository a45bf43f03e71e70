//! Storage layer for ringkv: the ordered key-value engine the core runs on.
//!
//! Keys live in one-byte namespaces (see [`keystore::ns`]). Two engines are
//! provided: `memory` (a bare memtable) and `wal` (WAL + memtable), both
//! behind the [`KeyStore`] trait and selectable by name through
//! [`BackendRegistry`].

pub mod backend;
pub mod engine;
pub mod keystore;
pub mod memtable;
pub mod record;
pub mod wal;

pub use backend::BackendRegistry;
pub use engine::{MemoryStore, WalStore};
pub use keystore::{KeyStore, StorageError};
pub use record::{Record, RecordError, RecordKind};
