//! Error types for the buffering and delivery subsystem.

use std::path::PathBuf;
use std::time::Duration;

/// Failure reported by a [`Sender`](crate::sender::Sender) implementation.
///
/// The transient/permanent split drives the retry policy: transient failures
/// are retried up to the configured attempt count, permanent failures go
/// straight to file backup (or surface as an error when backup is disabled).
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),

    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent(_))
    }
}

/// Errors that can occur while buffering, flushing, or recovering events.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The append was rejected because it would exceed the configured byte
    /// budget. Buffered state is left untouched; the caller decides whether
    /// to drop, block, or apply backpressure.
    #[error("buffer full: appending {requested} bytes would exceed the {max} byte budget (allocated {allocated})")]
    BufferFull {
        requested: usize,
        allocated: u64,
        max: u64,
    },

    /// A single record could not be serialized. Isolated to one append call;
    /// bytes already resident in the chunk store are never affected.
    #[error("failed to encode record: {0}")]
    Encoding(String),

    #[error(transparent)]
    Send(#[from] SendError),

    /// No acknowledgment was read back from the peer within the configured
    /// timeout.
    #[error("no acknowledgment received within {0:?}")]
    AckTimeout(Duration),

    /// The acknowledgment response did not have the expected
    /// `{"ack": <token>}` shape.
    #[error("malformed acknowledgment response: {0}")]
    AckProtocol(String),

    /// The peer answered with a token that does not belong to the chunk in
    /// flight. Stale tokens are ignored rather than accepted, so the chunk
    /// stays unconfirmed.
    #[error("acknowledgment token did not match the chunk in flight")]
    AckUnmatched,

    #[error("backup I/O error at {path}: {source}")]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A saved buffer file could not be parsed at startup. The file is left
    /// in place for operator inspection; startup continues with the
    /// remaining valid files.
    #[error("corrupt backup file {path}: {reason}")]
    BackupCorruption { path: PathBuf, reason: String },

    #[error("buffer is closed")]
    Closed,

    /// Data could not be delivered during close and no file backup is
    /// configured. This is the only path that constitutes permanent,
    /// user-visible data loss.
    #[error("{events} undelivered events ({bytes} bytes) discarded at close: no file backup is configured")]
    UnflushedData { events: usize, bytes: u64 },

    #[error("invalid buffer configuration: {0}")]
    InvalidConfig(String),
}
