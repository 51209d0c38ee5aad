//! Per-tag accumulation of encoded events.

use std::time::{Duration, Instant};

/// In-memory, append-only accumulation of encoded events for one tag.
///
/// A store grows on append and is drained once its bytes have been
/// confirmed delivered (or persisted to backup). It is owned exclusively by
/// the buffer that created it and is never shared across buffers.
#[derive(Debug)]
pub struct ChunkStore {
    tag: String,
    bytes: Vec<u8>,
    event_count: usize,
    created_at: Instant,
}

impl ChunkStore {
    #[must_use]
    pub fn new(tag: &str, now: Instant) -> Self {
        Self {
            tag: tag.to_string(),
            bytes: Vec::new(),
            event_count: 0,
            created_at: now,
        }
    }

    pub fn push(&mut self, encoded: &[u8], events: usize) {
        self.bytes.extend_from_slice(encoded);
        self.event_count += events;
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Byte length of the accumulated encoded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Time since the store was created or last drained.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Takes an immutable snapshot of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Chunk {
        Chunk {
            tag: self.tag.clone(),
            packed_events: self.bytes.clone(),
            event_count: self.event_count,
        }
    }

    /// Drains a delivered snapshot prefix, keeping any bytes appended after
    /// the snapshot was taken. Returns the number of bytes released.
    ///
    /// The age clock only restarts when the store empties; surviving bytes
    /// keep the old clock so a steady trickle cannot defer the retention
    /// rule forever.
    pub fn complete(&mut self, bytes: usize, events: usize, now: Instant) -> u64 {
        let drained = bytes.min(self.bytes.len());
        self.bytes.drain(..drained);
        self.event_count = self.event_count.saturating_sub(events);
        if self.bytes.is_empty() {
            self.created_at = now;
        }
        drained as u64
    }

    #[must_use]
    pub fn into_chunk(self) -> Chunk {
        Chunk {
            tag: self.tag,
            packed_events: self.bytes,
            event_count: self.event_count,
        }
    }
}

/// An immutable snapshot of a [`ChunkStore`] at flush time; the unit handed
/// to the sender as one network write.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub tag: String,
    pub packed_events: Vec<u8>,
    pub event_count: usize,
}
