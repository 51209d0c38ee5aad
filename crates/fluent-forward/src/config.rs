//! Buffer configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BufferError;
use crate::wire::TimestampFormat;

/// Default total buffered-byte budget: 512 MiB.
pub const DEFAULT_MAX_BUFFER_SIZE: u64 = 512 * 1024 * 1024;

/// Default per-chunk flush-eligibility threshold: 4 MiB.
pub const DEFAULT_CHUNK_SIZE_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Immutable configuration for a [`Buffer`](crate::buffer::Buffer).
///
/// All fields have working defaults; a plain `BufferConfig::default()` runs
/// with a 512 MiB budget, no ack-response mode, and no file backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum total buffered bytes across all chunk stores. Must be > 0.
    pub max_buffer_size: u64,

    /// A chunk store becomes flush-eligible once it holds at least this
    /// many bytes.
    pub chunk_size_threshold: u64,

    /// A chunk store also becomes flush-eligible once its oldest byte is
    /// this old, so low-volume tags still drain. `0` disables the age rule.
    pub chunk_retention_millis: u64,

    /// When enabled, each flushed chunk carries an ack token and stays
    /// buffered until the peer echoes it back.
    pub ack_response_mode: bool,

    /// How long to wait for the sender to complete one ack-mode write,
    /// including the acknowledgment read.
    pub ack_timeout_millis: u64,

    /// Delivery attempts per chunk before handing it to file backup (or
    /// reporting the failure). Must be >= 1.
    pub send_retry_count: usize,

    /// Directory for crash-recovery backup files. Unset disables backup.
    pub file_backup_dir: Option<PathBuf>,

    /// Wire encoding of event timestamps.
    pub timestamp_format: TimestampFormat,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            chunk_size_threshold: DEFAULT_CHUNK_SIZE_THRESHOLD,
            chunk_retention_millis: 1_000,
            ack_response_mode: false,
            ack_timeout_millis: 5_000,
            send_retry_count: 3,
            file_backup_dir: None,
            timestamp_format: TimestampFormat::EventTime,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.max_buffer_size == 0 {
            return Err(BufferError::InvalidConfig(
                "max_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_size_threshold == 0 || self.chunk_size_threshold > self.max_buffer_size {
            return Err(BufferError::InvalidConfig(
                "chunk_size_threshold must be in 1..=max_buffer_size".to_string(),
            ));
        }
        if self.send_retry_count == 0 {
            return Err(BufferError::InvalidConfig(
                "send_retry_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_millis)
    }

    #[must_use]
    pub fn chunk_retention(&self) -> Option<Duration> {
        (self.chunk_retention_millis > 0).then(|| Duration::from_millis(self.chunk_retention_millis))
    }
}
