use std::{path::PathBuf, time::Duration};

use crate::{
    error::{FrameError, Result},
    frame::FRAME_HEADER_SIZE_BYTES,
    row::INDEX_ROW_HEADER_SIZE_BYTES,
};

// Compile-time default frame size, selected via Cargo features.
// Exactly one of `page-4k`, `page-8k`, or `page-1m` should be enabled.
#[cfg(feature = "page-4k")]
pub const DEFAULT_FRAME_SIZE_BYTES: usize = 4096;
#[cfg(all(feature = "page-8k", not(feature = "page-4k")))]
pub const DEFAULT_FRAME_SIZE_BYTES: usize = 8192;
#[cfg(all(
    feature = "page-1m",
    not(any(feature = "page-4k", feature = "page-8k"))
))]
pub const DEFAULT_FRAME_SIZE_BYTES: usize = 1024 * 1024;

#[cfg(not(any(feature = "page-4k", feature = "page-8k", feature = "page-1m")))]
compile_error!(
    "One of `page-4k`, `page-8k`, or `page-1m` features must be enabled to select a frame size."
);

/// Engine-wide settings, built once at startup and handed to [`crate::EngineContext`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub frame_size: usize,
    /// How many times a write retries a row held by a live foreign transaction.
    pub row_lock_retries: u32,
    pub row_lock_backoff: Duration,
    /// Keep writers out for the whole flush instead of serving the flush from snapshots.
    pub exclusive_row_locking: bool,
    pub flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./framedb-data"),
            frame_size: DEFAULT_FRAME_SIZE_BYTES,
            row_lock_retries: 3,
            row_lock_backoff: Duration::from_secs(1),
            exclusive_row_locking: false,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_row_lock_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.row_lock_retries = retries;
        self.row_lock_backoff = backoff;
        self
    }

    pub fn with_exclusive_row_locking(mut self, enabled: bool) -> Self {
        self.exclusive_row_locking = enabled;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Reject frame sizes that cannot hold a header plus one index row, or that
    /// overflow the 4-byte size fields of the header.
    pub fn validate(&self) -> Result<()> {
        let minimum = FRAME_HEADER_SIZE_BYTES + INDEX_ROW_HEADER_SIZE_BYTES;
        if self.frame_size < minimum {
            return Err(FrameError::Config(format!(
                "frame size {} is below the minimum of {minimum} bytes",
                self.frame_size
            )));
        }
        if self.frame_size > i32::MAX as usize {
            return Err(FrameError::Config(format!(
                "frame size {} does not fit the header's size fields",
                self.frame_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.frame_size, DEFAULT_FRAME_SIZE_BYTES);
        assert_eq!(config.row_lock_retries, 3);
        assert_eq!(config.row_lock_backoff, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tiny_frames_are_rejected() {
        let config = EngineConfig::default().with_frame_size(64);
        assert!(matches!(config.validate(), Err(FrameError::Config(_))));
    }
}
