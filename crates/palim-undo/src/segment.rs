//! Fixed-size undo segment files.
//!
//! A log is a logical concatenation of equally sized segment files. The
//! segment layer knows nothing about records; the log layer splits reads
//! and writes that cross a segment boundary.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::UndoResult;

/// One segment file of an undo log.
pub struct UndoSegment {
    /// Segment number within its log.
    segno: u64,
    /// Path to the segment file.
    path: PathBuf,
    /// File handle.
    file: Mutex<File>,
    /// Segment size in bytes.
    size: usize,
}

impl UndoSegment {
    /// Creates a new segment file, preallocated to its full size.
    pub fn create(segno: u64, path: impl AsRef<Path>, size: usize) -> UndoResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        Ok(Self {
            segno,
            path,
            file: Mutex::new(file),
            size,
        })
    }

    /// Opens an existing segment file.
    pub fn open(segno: u64, path: impl AsRef<Path>, size: usize) -> UndoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            segno,
            path,
            file: Mutex::new(file),
            size,
        })
    }

    /// Returns the segment number.
    pub fn segno(&self) -> u64 {
        self.segno
    }

    /// Returns the segment size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the path to this segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `bytes` at the given offset within the segment.
    ///
    /// The caller guarantees the write fits; spanning writes are split by
    /// the log layer.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> UndoResult<()> {
        debug_assert!(offset + bytes.len() <= self.size, "write past segment end");
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Reads `buf.len()` bytes from the given offset within the segment.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> UndoResult<()> {
        debug_assert!(offset + buf.len() <= self.size, "read past segment end");
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Flushes the segment to durable storage.
    pub fn sync(&self) -> UndoResult<()> {
        let file = self.file.lock();
        file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for UndoSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoSegment")
            .field("segno", &self.segno)
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("0000000000.useg");
        let segment = UndoSegment::create(0, &path, 4096).unwrap();

        segment.write_at(100, b"hello undo").unwrap();

        let mut buf = [0u8; 10];
        segment.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello undo");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("0000000001.useg");
        {
            let segment = UndoSegment::create(1, &path, 4096).unwrap();
            segment.write_at(0, b"persist me").unwrap();
            segment.sync().unwrap();
        }

        let segment = UndoSegment::open(1, &path, 4096).unwrap();
        let mut buf = [0u8; 10];
        segment.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persist me");
        assert_eq!(segment.segno(), 1);
    }
}
