//! The ordered key-value interface every engine implements.

use crate::wal::WalError;

/// One-byte namespaces that partition the key space of a store.
pub mod ns {
    /// key -> encoded `Record`
    pub const DATA: u8 = b'd';
    /// merkle node key -> node or leaf
    pub const MERKLE: u8 = b'm';
    /// expiry bucket -> NUL-delimited key list
    pub const EXPIRE: u8 = b'x';
    /// repartition checkpoints
    pub const PARTITION: u8 = b'p';
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),
}

/// Ordered byte-string store, namespaced by a sub-prefix byte.
///
/// All operations are synchronous; the async boundary is at the caller.
pub trait KeyStore: Send + Sync + 'static {
    fn get(&self, sub: u8, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, sub: u8, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&self, sub: u8, key: &[u8]) -> Result<(), StorageError>;

    /// Visit `[start, end)` in key order within namespace `sub`, stopping
    /// early when `visit` returns `false`. An empty `end` means "to the end
    /// of the namespace".
    ///
    /// The visitor runs after the engine's locks are released, so it may
    /// call back into the store.
    fn range(
        &self,
        sub: u8,
        start: &[u8],
        end: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<(), StorageError>;

    /// Make buffered writes durable.
    fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Collect `[start, end)` of a namespace into owned pairs.
pub fn collect_range(
    store: &dyn KeyStore,
    sub: u8,
    start: &[u8],
    end: &[u8],
    limit: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
    let mut out = Vec::new();
    store.range(sub, start, end, &mut |k, v| {
        out.push((k.to_vec(), v.to_vec()));
        out.len() < limit
    })?;
    Ok(out)
}

/// Full engine key for a namespaced key.
pub(crate) fn full_key(sub: u8, key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(key.len() + 1);
    full.push(sub);
    full.extend_from_slice(key);
    full
}
