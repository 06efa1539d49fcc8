//! Window extraction configuration
//!
//! [`WindowConfig`] carries the windowing geometry (`seq_len`, `stride`), the
//! shard rotation threshold, and the scheduling knobs of the concurrent
//! pipeline. It round-trips through JSON so a run can be reproduced from the
//! file stored next to its shards.

use crate::error::{Result, WindowingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one shard-creation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window length in frames; also the capacity of each ring buffer. Default: **90**.
    pub seq_len: usize,

    /// Frames between consecutive window starts, `1 <= stride <= seq_len`. Default: **30**.
    pub stride: usize,

    /// Shard size in bytes after which the writer rotates to a new file. Default: **3e9**.
    pub max_shard_size: u64,

    /// Number of window-writer workers. `None` uses the available hardware parallelism.
    pub num_workers: Option<usize>,

    /// Upper bound on dispatched but unfinished windows. `None` means twice the worker count.
    pub max_pending_windows: Option<usize>,

    /// Interval at which waiting stages re-check the cursors, in milliseconds. Default: **10**.
    pub poll_interval_ms: u64,

    /// Maximum time the coordinator waits for a window without any producer progress.
    ///
    /// `None` (the default) disables the watchdog; producer failures are still
    /// reported immediately.
    pub stall_timeout_ms: Option<u64>,

    /// Log per-stage progress every N frames. Default: **100**.
    pub progress_log_interval: usize,

    /// Prefix of shard file names. Default: **"dstg"**.
    pub shard_prefix: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            seq_len: 90,
            stride: 30,
            max_shard_size: 3_000_000_000,
            num_workers: None,
            max_pending_windows: None,
            poll_interval_ms: 10,
            stall_timeout_ms: None,
            progress_log_interval: 100,
            shard_prefix: "dstg".to_string(),
        }
    }
}

impl WindowConfig {
    /// Create a config with the given window geometry and defaults elsewhere
    pub fn new(seq_len: usize, stride: usize) -> Self {
        Self {
            seq_len,
            stride,
            ..Default::default()
        }
    }

    /// Load and validate a config from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WindowConfig = serde_json::from_str(&contents).map_err(|e| {
            WindowingError::config(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config as pretty-printed JSON, creating parent directories
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject configurations that would skip frames or cannot run
    pub fn validate(&self) -> Result<()> {
        if self.seq_len == 0 {
            return Err(WindowingError::config("seq_len must be at least 1"));
        }
        if self.stride == 0 {
            return Err(WindowingError::config("stride must be at least 1"));
        }
        if self.stride > self.seq_len {
            return Err(WindowingError::config(format!(
                "stride {} exceeds seq_len {}: frames between windows would be skipped",
                self.stride, self.seq_len
            )));
        }
        if self.max_shard_size == 0 {
            return Err(WindowingError::config("max_shard_size must be positive"));
        }
        if self.num_workers == Some(0) {
            return Err(WindowingError::config("num_workers must be at least 1"));
        }
        if self.max_pending_windows == Some(0) {
            return Err(WindowingError::config("max_pending_windows must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(WindowingError::config("poll_interval_ms must be positive"));
        }
        if self.shard_prefix.is_empty() {
            return Err(WindowingError::config("shard_prefix must not be empty"));
        }
        Ok(())
    }

    /// Ring buffer capacity; one slot per frame of a window
    pub fn capacity(&self) -> usize {
        self.seq_len
    }

    pub fn workers(&self) -> usize {
        self.num_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn pending_limit(&self) -> usize {
        self.max_pending_windows.unwrap_or(self.workers() * 2)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    /// Human-readable shard naming pattern, e.g. `dstg-w90-s30-%05d.tar`
    pub fn shard_pattern(&self) -> String {
        format!(
            "{}-w{}-s{}-%05d.tar",
            self.shard_prefix, self.seq_len, self.stride
        )
    }

    /// File name of shard number `index`
    pub fn shard_file_name(&self, index: usize) -> String {
        format!(
            "{}-w{}-s{}-{:05}.tar",
            self.shard_prefix, self.seq_len, self.stride, index
        )
    }

    /// Window end indices emitted for a video of `frame_count` frames
    ///
    /// A window ending at `n` covers frames `[n - seq_len, n)` and is emitted
    /// only when all of those frames exist. No partial trailing window.
    pub fn expected_window_ends(&self, frame_count: usize) -> Vec<usize> {
        if self.stride == 0 || self.seq_len == 0 {
            return Vec::new();
        }
        (self.seq_len..=frame_count).step_by(self.stride).collect()
    }
}
