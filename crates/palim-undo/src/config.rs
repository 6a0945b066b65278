//! Undo store configuration.

use std::path::{Path, PathBuf};

use palim_common::constants::UNDO_SEGMENT_SIZE;

/// Configuration for the undo store.
///
/// # Example
///
/// ```rust
/// use palim_undo::UndoStoreConfig;
///
/// let config = UndoStoreConfig::new("/tmp/undo").with_segment_size(64 * 1024);
/// assert_eq!(config.segment_size, 64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct UndoStoreConfig {
    /// Directory holding one subdirectory per undo log.
    pub dir: PathBuf,
    /// Size of each segment file in bytes.
    pub segment_size: usize,
    /// Whether appends fsync before returning. Tests turn this off.
    pub sync_on_append: bool,
}

impl UndoStoreConfig {
    /// Creates a configuration rooted at the given directory.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            segment_size: UNDO_SEGMENT_SIZE,
            sync_on_append: true,
        }
    }

    /// Sets the segment file size.
    #[must_use]
    pub fn with_segment_size(mut self, bytes: usize) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Sets whether appends sync to disk.
    #[must_use]
    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Directory holding one log's segments and meta file.
    pub fn log_dir(&self, log_no: u32) -> PathBuf {
        self.dir.join(format!("{:06}", log_no))
    }

    /// Path of a segment file within a log.
    pub fn segment_path(&self, log_no: u32, segno: u64) -> PathBuf {
        self.log_dir(log_no).join(format!("{:010}.useg", segno))
    }

    /// Path of a log's meta file.
    pub fn meta_path(&self, log_no: u32) -> PathBuf {
        self.log_dir(log_no).join("log.meta")
    }

    /// Segment number containing the given byte offset.
    pub fn segno_for_offset(&self, offset: u64) -> u64 {
        offset / self.segment_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let config = UndoStoreConfig::new("/u");
        assert_eq!(
            config.segment_path(3, 7),
            PathBuf::from("/u/000003/0000000007.useg")
        );
        assert_eq!(config.meta_path(3), PathBuf::from("/u/000003/log.meta"));
    }

    #[test]
    fn test_segno_for_offset() {
        let config = UndoStoreConfig::new("/u").with_segment_size(1024);
        assert_eq!(config.segno_for_offset(0), 0);
        assert_eq!(config.segno_for_offset(1023), 0);
        assert_eq!(config.segno_for_offset(1024), 1);
        assert_eq!(config.segno_for_offset(10_000), 9);
    }
}
