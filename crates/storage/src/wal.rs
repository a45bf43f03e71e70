//! Write-Ahead Log (WAL) for durability.
//!
//! Format: each entry is `[4-byte CRC32][4-byte length][JSON payload]\n`.
//! On recovery, replay all valid entries. Corrupt tail entries are truncated.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("WAL entry has invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync periodically (caller controls).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// One logged mutation. Keys and values are hex so the payload stays JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub key: String,
    /// `None` is a delete.
    pub value: Option<String>,
}

impl WalEntry {
    pub fn put(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: hex::encode(key),
            value: Some(hex::encode(value)),
        }
    }

    pub fn delete(key: &[u8]) -> Self {
        Self {
            key: hex::encode(key),
            value: None,
        }
    }

    /// Decode to `(key, Some(value))` or `(key, None)` for deletes.
    pub fn decode(&self) -> Result<(Vec<u8>, Option<Vec<u8>>), WalError> {
        let key = hex::decode(&self.key)?;
        let value = match &self.value {
            Some(v) => Some(hex::decode(v)?),
            None => None,
        };
        Ok((key, value))
    }
}

/// An append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            entries_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry to the WAL.
    pub fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
        write_entry(&mut self.writer, entry)?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of entries written since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Replace the log with `entries`: write a sibling file, fsync it, then
    /// rename it over the live log and reopen for appending.
    pub fn rewrite(&mut self, entries: impl Iterator<Item = WalEntry>) -> Result<(), WalError> {
        let tmp = self.path.with_extension("compact");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            for entry in entries {
                write_entry(&mut writer, &entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.entries_written = 0;
        Ok(())
    }

    /// Replay all valid entries from a WAL file.
    /// Returns the entries in order. Stops at the first corrupt entry.
    pub fn replay(path: &Path) -> Result<Vec<WalEntry>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut entry_num = 0u64;

        loop {
            // Read CRC (4 bytes)
            let mut crc_buf = [0u8; 4];
            match io::Read::read_exact(&mut reader, &mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // clean EOF
                Err(e) => return Err(WalError::Io(e)),
            }
            let expected_crc = u32::from_le_bytes(crc_buf);

            // Treat UnexpectedEof as a truncated entry (stop replay).
            macro_rules! read_or_break {
                ($reader:expr, $buf:expr) => {
                    match io::Read::read_exact($reader, $buf) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            tracing::warn!(
                                "WAL truncated mid-entry at entry {}; stopping replay",
                                entry_num
                            );
                            break;
                        }
                        Err(e) => return Err(WalError::Io(e)),
                    }
                };
            }

            let mut len_buf = [0u8; 4];
            read_or_break!(&mut reader, &mut len_buf);
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            read_or_break!(&mut reader, &mut payload);

            let mut nl = [0u8; 1];
            read_or_break!(&mut reader, &mut nl);

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            let actual_crc = hasher.finalize();

            if actual_crc != expected_crc {
                tracing::warn!(
                    "WAL CRC mismatch at entry {}: expected {:#010x}, got {:#010x}; stopping replay",
                    entry_num,
                    expected_crc,
                    actual_crc
                );
                break;
            }

            let entry: WalEntry = serde_json::from_slice(&payload)?;
            entries.push(entry);
            entry_num += 1;
        }

        Ok(entries)
    }
}

fn write_entry<W: Write>(writer: &mut W, entry: &WalEntry) -> Result<(), WalError> {
    let payload = serde_json::to_vec(entry)?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    // CRC(4) + LEN(4) + PAYLOAD + \n
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::put(b"dk1", b"v1")).unwrap();
            wal.append(&WalEntry::put(b"dk2", b"v2")).unwrap();
            wal.append(&WalEntry::delete(b"dk1")).unwrap();
            assert_eq!(wal.entries_written(), 3);
        }

        let entries = Wal::replay(&wal_path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0].decode().unwrap(),
            (b"dk1".to_vec(), Some(b"v1".to_vec()))
        );
        assert_eq!(entries[2].decode().unwrap(), (b"dk1".to_vec(), None));
    }

    #[test]
    fn test_wal_replay_empty() {
        let dir = TempDir::new().unwrap();
        let entries = Wal::replay(&dir.path().join("empty.wal")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_wal_replay_truncated() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&WalEntry::put(b"k1", b"v1")).unwrap();
            wal.append(&WalEntry::put(b"k2", b"v2")).unwrap();
            wal.append(&WalEntry::put(b"k3", b"v3")).unwrap();
        }

        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 5).unwrap();
        }

        let entries = Wal::replay(&wal_path).unwrap();
        assert_eq!(entries.len(), 2, "should recover 2 of 3 entries");
    }

    #[test]
    fn test_wal_binary_values_survive() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("bin.wal");
        let value: Vec<u8> = (0..=255).collect();

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::None).unwrap();
            wal.append(&WalEntry::put(&[0, 1, 2], &value)).unwrap();
        }

        let entries = Wal::replay(&wal_path).unwrap();
        assert_eq!(entries[0].decode().unwrap().1, Some(value));
    }

    #[test]
    fn test_wal_rewrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("rw.wal");

        let mut wal = Wal::open(&wal_path, FsyncPolicy::None).unwrap();
        for i in 0..10u8 {
            wal.append(&WalEntry::put(b"k", &[i])).unwrap();
        }
        wal.rewrite(std::iter::once(WalEntry::put(b"k", &[9])))
            .unwrap();
        wal.append(&WalEntry::put(b"j", b"x")).unwrap();
        drop(wal);

        let entries = Wal::replay(&wal_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].decode().unwrap().1, Some(vec![9]));
    }
}
