//! Engine configuration.

use std::time::Duration;

use crate::constants::{ROLLBACK_FOREGROUND_LIMIT, ROLLBACK_WINDOW_SIZE};

/// Runtime-tunable engine settings.
///
/// Page geometry is compile-time (see [`crate::constants`]); everything
/// here can differ per engine instance.
///
/// # Example
///
/// ```rust
/// use palim_common::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_full_page_writes(false)
///     .with_rollback_foreground_limit(8 * 1024);
/// assert!(!config.full_page_writes);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether WAL records may rely on full-page images. When off, WAL
    /// payloads must carry enough to reconstruct deletes by themselves.
    pub full_page_writes: bool,
    /// Undo size up to which an abort is rolled back in-process.
    pub rollback_foreground_limit: usize,
    /// Window size for batched rollback reads.
    pub rollback_window: usize,
    /// Shortest hibernation interval of the background undo worker.
    pub worker_min_naptime: Duration,
    /// Longest hibernation interval of the background undo worker.
    pub worker_max_naptime: Duration,
    /// Tuple width above which a relation wants out-of-line storage.
    pub toast_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            full_page_writes: true,
            rollback_foreground_limit: ROLLBACK_FOREGROUND_LIMIT,
            rollback_window: ROLLBACK_WINDOW_SIZE,
            worker_min_naptime: Duration::from_millis(100),
            worker_max_naptime: Duration::from_secs(10),
            toast_threshold: crate::constants::PAGE_SIZE / 4,
        }
    }
}

impl EngineConfig {
    /// Sets whether full-page writes are enabled.
    #[must_use]
    pub fn with_full_page_writes(mut self, enabled: bool) -> Self {
        self.full_page_writes = enabled;
        self
    }

    /// Sets the foreground rollback size limit.
    #[must_use]
    pub fn with_rollback_foreground_limit(mut self, bytes: usize) -> Self {
        self.rollback_foreground_limit = bytes;
        self
    }

    /// Sets the rollback read window size.
    #[must_use]
    pub fn with_rollback_window(mut self, bytes: usize) -> Self {
        self.rollback_window = bytes;
        self
    }

    /// Sets the undo worker hibernation bounds.
    #[must_use]
    pub fn with_worker_naptime(mut self, min: Duration, max: Duration) -> Self {
        self.worker_min_naptime = min;
        self.worker_max_naptime = max;
        self
    }
}
