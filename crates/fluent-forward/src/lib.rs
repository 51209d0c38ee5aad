//! # Fluent Forward Client Core
//!
//! Buffering and reliable-delivery core for a Fluentd forward-protocol
//! client. Applications emit structured records (tag, timestamp, key-value
//! payload); this crate accumulates them into size-bounded buffers,
//! serializes them in the compact packed-forward MessagePack format, and
//! hands completed chunks to a pluggable [`Sender`] for delivery to a
//! collector.
//!
//! ## Architecture
//!
//! - [`buffer`]: the buffer engine — size accounting, flush orchestration,
//!   and the [`BufferBackend`] storage seam
//! - [`encoder`]: per-thread event encoding into the packed-forward format
//! - [`wire`]: chunk framing and acknowledgment parsing, bit-compatible
//!   with the standard forward collector protocol
//! - [`ack`]: ack-response mode token bookkeeping
//! - [`backup`]: disk persistence of in-flight chunks for crash recovery
//! - [`sender`]: the transport seam consumed by the buffer
//!
//! Transport scheduling (when to flush), socket handling, and the
//! high-level client facade are deliberately out of scope; callers drive
//! [`Buffer::flush`] from their own timer and supply their own [`Sender`].
//!
//! ## Delivery semantics
//!
//! A chunk store is only cleared after its bytes are confirmed delivered —
//! a successful sender write outside ack mode, or a matching ack token in
//! ack-response mode. Failed chunks stay buffered for the next flush, and
//! chunks whose retries are exhausted are persisted to the backup
//! directory when one is configured, giving at-least-once delivery with
//! zero data loss across process restarts.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

/// Ack-response mode token bookkeeping
pub mod ack;

/// Disk persistence of in-flight chunks across restarts
pub mod backup;

/// The buffer engine and storage backends
pub mod buffer;

/// Per-tag accumulation of encoded events
pub mod chunk;

/// Buffer configuration
pub mod config;

/// Per-worker event encoding
pub mod encoder;

/// Error types
pub mod error;

/// Ordered key-value record payloads
pub mod record;

/// The transport seam consumed by the buffer
pub mod sender;

/// Forward wire-protocol primitives
pub mod wire;

pub use ack::{AckCoordinator, AckToken};
pub use backup::FileBackup;
pub use buffer::{Buffer, BufferBackend, FlushPolicy, MemoryBackend};
pub use chunk::{Chunk, ChunkStore};
pub use config::BufferConfig;
pub use encoder::RecordEncoder;
pub use error::{BufferError, SendError};
pub use record::{Record, Value};
pub use sender::{ChunkMetadata, SendOutcome, Sender};
pub use wire::TimestampFormat;
