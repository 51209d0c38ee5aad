//! The transport seam consumed by the buffer.

use async_trait::async_trait;

use crate::error::SendError;

/// Per-chunk metadata handed to the sender alongside the framed bytes.
///
/// The same values are already embedded in the chunk's option map; they are
/// surfaced here so transports can log or route without re-parsing the
/// frame.
#[derive(Debug, Clone)]
pub struct ChunkMetadata {
    /// Byte length of the packed events inside the frame.
    pub packed_size: usize,
    /// Number of events inside the frame.
    pub event_count: usize,
    /// Token the peer must echo back, present in ack-response mode.
    pub ack_token: Option<Vec<u8>>,
}

/// Result of a successful network write.
#[derive(Debug, Default)]
pub struct SendOutcome {
    /// Raw acknowledgment payload read back from the peer, when the
    /// transport is operating in ack-response mode. `None` outside ack
    /// mode, where a successful write alone counts as delivered.
    pub ack: Option<Vec<u8>>,
}

impl SendOutcome {
    /// A write that succeeded with no acknowledgment payload.
    #[must_use]
    pub fn delivered() -> Self {
        Self::default()
    }

    /// A write that succeeded and read back an acknowledgment payload.
    #[must_use]
    pub fn with_ack(payload: Vec<u8>) -> Self {
        Self { ack: Some(payload) }
    }
}

/// Performs the physical network write for one chunk.
///
/// Implementations own sockets, TLS, and framing; the buffer only cares
/// about the outcome. Errors must distinguish transient failures (worth
/// retrying) from permanent ones (retrying the same bytes cannot help).
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(
        &self,
        tag: &str,
        chunk: &[u8],
        metadata: &ChunkMetadata,
    ) -> Result<SendOutcome, SendError>;
}
