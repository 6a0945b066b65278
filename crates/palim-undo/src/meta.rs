//! Per-log durable metadata.
//!
//! Each undo log keeps a small meta file recording its durable insertion
//! point, its discard offset, the oldest xid whose undo it still holds,
//! and the writer attached at the time of the last flush. The file is
//! rewritten atomically (temp file + rename) so a crash leaves either the
//! old or the new contents, never a mix.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut};

use palim_common::constants::{UNDO_META_MAGIC, UNDO_META_VERSION};
use palim_common::Xid;

use crate::error::{UndoError, UndoResult};

/// Encoded size of the meta file contents.
const META_ENCODED_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 4;

/// Durable state of one undo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoLogMeta {
    /// Byte offset at which the next record will be written.
    pub insert: u64,
    /// Byte offset of the oldest undiscarded data (`oldest_data`).
    pub discard: u64,
    /// Offset of the newest transaction-header record, or zero. Restored
    /// on reopen so the next transaction can link itself into the chain.
    pub last_xact_start: u64,
    /// Oldest xid that still has undo in this log.
    pub oldest_xid: Xid,
    /// Writer attached when the meta was last flushed, or invalid.
    pub attached_writer: Xid,
}

impl UndoLogMeta {
    /// Meta for a freshly created log whose first record starts at
    /// `first_offset` (past the log header block).
    pub fn fresh(first_offset: u64) -> Self {
        Self {
            insert: first_offset,
            discard: first_offset,
            last_xact_start: 0,
            oldest_xid: Xid::INVALID,
            attached_writer: Xid::INVALID,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_ENCODED_SIZE);
        buf.put_u32(UNDO_META_MAGIC);
        buf.put_u32(UNDO_META_VERSION);
        buf.put_u64(self.insert);
        buf.put_u64(self.discard);
        buf.put_u64(self.last_xact_start);
        buf.put_u64(self.oldest_xid.as_u64());
        buf.put_u64(self.attached_writer.as_u64());
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    fn decode(mut buf: &[u8]) -> UndoResult<Self> {
        if buf.len() != META_ENCODED_SIZE {
            return Err(UndoError::corrupted(format!(
                "undo meta file has {} bytes, expected {}",
                buf.len(),
                META_ENCODED_SIZE
            )));
        }

        let body = &buf[..META_ENCODED_SIZE - 4];
        let computed = crc32fast::hash(body);

        let magic = buf.get_u32();
        if magic != UNDO_META_MAGIC {
            return Err(UndoError::corrupted(format!(
                "bad undo meta magic {:#010x}",
                magic
            )));
        }
        let version = buf.get_u32();
        if version != UNDO_META_VERSION {
            return Err(UndoError::corrupted(format!(
                "unsupported undo meta version {}",
                version
            )));
        }

        let insert = buf.get_u64();
        let discard = buf.get_u64();
        let last_xact_start = buf.get_u64();
        let oldest_xid = Xid::new(buf.get_u64());
        let attached_writer = Xid::new(buf.get_u64());
        let stored = buf.get_u32();
        if stored != computed {
            return Err(UndoError::corrupted(
                "undo meta checksum mismatch".to_string(),
            ));
        }

        Ok(Self {
            insert,
            discard,
            last_xact_start,
            oldest_xid,
            attached_writer,
        })
    }

    /// Loads the meta file at `path`.
    pub fn load(path: impl AsRef<Path>) -> UndoResult<Self> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::decode(&buf)
    }

    /// Atomically rewrites the meta file at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> UndoResult<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("meta.tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&self.encode())?;
        file.sync_data()?;
        drop(file);

        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.meta");

        let meta = UndoLogMeta {
            insert: 8192,
            discard: 64,
            last_xact_start: 4096,
            oldest_xid: Xid::from_parts(0, 9),
            attached_writer: Xid::from_parts(0, 11),
        };
        meta.save(&path).unwrap();
        assert_eq!(UndoLogMeta::load(&path).unwrap(), meta);
    }

    #[test]
    fn test_fresh() {
        let meta = UndoLogMeta::fresh(64);
        assert_eq!(meta.insert, 64);
        assert_eq!(meta.discard, 64);
        assert!(!meta.oldest_xid.is_valid());
    }

    #[test]
    fn test_corrupt_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("log.meta");
        UndoLogMeta::fresh(64).save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0x55;
        std::fs::write(&path, &bytes).unwrap();

        assert!(UndoLogMeta::load(&path).is_err());
    }
}
