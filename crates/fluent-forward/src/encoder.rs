//! Per-worker event encoding.
//!
//! Each producer thread gets its own [`RecordEncoder`] (the buffer pins one
//! per thread with `thread_local!`), so no encoder state is ever shared
//! across threads. The scratch buffer is reused between appends; a failed
//! encode only leaves garbage in the scratch, never in a chunk store.

use crate::error::BufferError;
use crate::record::Record;
use crate::wire::{self, TimestampFormat};

/// Serializes `(timestamp, record)` pairs into the packed-forward event
/// format, reusing an internal scratch buffer across calls.
#[derive(Debug, Default)]
pub struct RecordEncoder {
    scratch: Vec<u8>,
}

impl RecordEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one event and returns the encoded bytes.
    ///
    /// The returned slice borrows the scratch buffer and is only valid
    /// until the next call. On error the scratch is cleared and nothing is
    /// returned, so callers can never copy a partial event into a chunk.
    pub fn encode(
        &mut self,
        timestamp_millis: i64,
        record: &Record,
        format: TimestampFormat,
    ) -> Result<&[u8], BufferError> {
        self.scratch.clear();
        match wire::write_event(&mut self.scratch, timestamp_millis, record, format) {
            Ok(()) => Ok(&self.scratch),
            Err(err) => {
                self.scratch.clear();
                Err(err)
            }
        }
    }
}
