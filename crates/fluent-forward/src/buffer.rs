//! The buffer engine: size-bounded accumulation, flush orchestration,
//! ack-response handling, and crash recovery.
//!
//! Producers on any number of threads call [`Buffer::append`]; a periodic
//! task owned by the caller drives [`Buffer::flush`] and, at shutdown,
//! [`Buffer::close`]. The storage layout lives behind [`BufferBackend`] so
//! alternative layouts can be swapped in without touching the threshold,
//! ack, or backup logic.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::ack::{AckCoordinator, AckToken};
use crate::backup::FileBackup;
use crate::chunk::{Chunk, ChunkStore};
use crate::config::BufferConfig;
use crate::encoder::RecordEncoder;
use crate::error::BufferError;
use crate::record::Record;
use crate::sender::{ChunkMetadata, Sender};
use crate::wire;

thread_local! {
    // One encoder per producer thread; no shared mutable encoder state.
    static ENCODER: RefCell<RecordEncoder> = RefCell::new(RecordEncoder::new());
}

/// Decides when a non-empty chunk store is eligible for a non-forced flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub size_threshold: u64,
    pub retention: Option<Duration>,
}

impl FlushPolicy {
    #[must_use]
    pub fn eligible(&self, store: &ChunkStore, now: Instant) -> bool {
        store.len() as u64 >= self.size_threshold
            || self.retention.is_some_and(|d| store.age(now) >= d)
    }
}

/// Physical storage strategy for chunk stores.
///
/// Implementations only manage layout and size accounting; flush
/// eligibility, ack handling, and backup stay in [`Buffer`].
pub trait BufferBackend: Send {
    /// Appends pre-encoded event bytes for `tag`.
    fn append(&mut self, tag: &str, encoded: &[u8], events: usize, now: Instant);

    /// Total bytes currently held across all stores.
    fn current_size(&self) -> u64;

    /// Snapshots every store that is flush-eligible under `policy` (or
    /// every non-empty store when `force` is set).
    fn chunks(&self, policy: &FlushPolicy, force: bool, now: Instant) -> Vec<Chunk>;

    /// Releases a delivered snapshot prefix for `tag`, returning the bytes
    /// freed. Bytes appended after the snapshot stay buffered.
    fn complete(&mut self, tag: &str, bytes: usize, events: usize) -> u64;

    /// Empties the backend, returning whatever was still buffered.
    fn drain(&mut self) -> Vec<Chunk>;
}

/// One contiguous growing byte buffer per tag.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    stores: HashMap<String, ChunkStore>,
    size: u64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferBackend for MemoryBackend {
    fn append(&mut self, tag: &str, encoded: &[u8], events: usize, now: Instant) {
        let store = self
            .stores
            .entry(tag.to_string())
            .or_insert_with(|| ChunkStore::new(tag, now));
        store.push(encoded, events);
        self.size += encoded.len() as u64;
    }

    fn current_size(&self) -> u64 {
        self.size
    }

    fn chunks(&self, policy: &FlushPolicy, force: bool, now: Instant) -> Vec<Chunk> {
        self.stores
            .values()
            .filter(|store| !store.is_empty() && (force || policy.eligible(store, now)))
            .map(ChunkStore::snapshot)
            .collect()
    }

    fn complete(&mut self, tag: &str, bytes: usize, events: usize) -> u64 {
        let Some(store) = self.stores.get_mut(tag) else {
            return 0;
        };
        let freed = store.complete(bytes, events, Instant::now());
        if store.is_empty() {
            self.stores.remove(tag);
        }
        self.size -= freed;
        freed
    }

    fn drain(&mut self) -> Vec<Chunk> {
        self.size = 0;
        self.stores
            .drain()
            .map(|(_, store)| store.into_chunk())
            .filter(|chunk| !chunk.packed_events.is_empty())
            .collect()
    }
}

/// Thread-safe, size-bounded event buffer with at-least-once delivery.
pub struct Buffer {
    config: BufferConfig,
    inner: Mutex<Box<dyn BufferBackend>>,
    /// Mirror of the backend's current size for lock-free usage reads.
    allocated: AtomicU64,
    /// Serializes flushes so the sender never sees two writes racing over
    /// the same tag's current chunk.
    flush_lock: tokio::sync::Mutex<()>,
    acks: Option<AckCoordinator>,
    backup: Option<FileBackup>,
    closed: AtomicBool,
}

impl Buffer {
    /// Creates a buffer with the in-memory backend. When a backup
    /// directory is configured, previously saved chunks are replayed
    /// before the buffer accepts any production traffic.
    pub fn new(config: BufferConfig) -> Result<Self, BufferError> {
        Self::with_backend(config, Box::new(MemoryBackend::new()))
    }

    /// Creates a buffer over an explicit storage backend.
    pub fn with_backend(
        config: BufferConfig,
        backend: Box<dyn BufferBackend>,
    ) -> Result<Self, BufferError> {
        config.validate()?;
        let backup = config
            .file_backup_dir
            .as_deref()
            .map(FileBackup::new)
            .transpose()?;
        let buffer = Self {
            acks: config.ack_response_mode.then(AckCoordinator::new),
            backup,
            config,
            inner: Mutex::new(backend),
            allocated: AtomicU64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        buffer.replay_saved_chunks()?;
        Ok(buffer)
    }

    /// Appends one event. Fails fast with [`BufferError::BufferFull`] when
    /// the encoded event would push the allocated size past the budget;
    /// the caller owns the retry/drop/backpressure policy.
    #[allow(clippy::expect_used)]
    pub fn append(
        &self,
        tag: &str,
        timestamp_millis: i64,
        record: &Record,
    ) -> Result<(), BufferError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        ENCODER.with(|encoder| {
            let mut encoder = encoder.borrow_mut();
            let encoded = encoder.encode(timestamp_millis, record, self.config.timestamp_format)?;

            // Size check and byte write share one critical section, so the
            // budget can never be overshot past the failing append.
            let mut inner = self.inner.lock().expect("lock poisoned");
            let allocated = inner.current_size();
            let requested = encoded.len();
            if allocated + requested as u64 > self.config.max_buffer_size {
                return Err(BufferError::BufferFull {
                    requested,
                    allocated,
                    max: self.config.max_buffer_size,
                });
            }
            inner.append(tag, encoded, 1, Instant::now());
            self.allocated.store(inner.current_size(), Ordering::Release);
            Ok(())
        })
    }

    /// Flushes flush-eligible chunks (all non-empty chunks when `force` is
    /// set) through `sender`.
    ///
    /// A chunk store is only cleared after its snapshot is confirmed
    /// delivered, or after the snapshot has been persisted to file backup;
    /// anything else leaves the bytes intact for the next attempt.
    pub async fn flush(&self, sender: &dyn Sender, force: bool) -> Result<(), BufferError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        let _guard = self.flush_lock.lock().await;
        self.flush_locked(sender, force).await
    }

    /// Final forced flush, then disposal of any undeliverable residue.
    /// Idempotent: the second call is a no-op.
    #[allow(clippy::expect_used)]
    pub async fn close(&self, sender: &dyn Sender) -> Result<(), BufferError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("buffer already closed");
            return Ok(());
        }
        let _guard = self.flush_lock.lock().await;
        let flush_result = self.flush_locked(sender, true).await;

        let residue = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let residue = inner.drain();
            self.allocated.store(0, Ordering::Release);
            residue
        };
        if residue.is_empty() {
            return flush_result;
        }

        match &self.backup {
            Some(backup) => {
                for chunk in &residue {
                    backup.save(&chunk.tag, &chunk.packed_events)?;
                }
                warn!(
                    chunks = residue.len(),
                    "persisted undelivered chunks to file backup during close"
                );
                Ok(())
            }
            None => {
                let events = residue.iter().map(|c| c.event_count).sum();
                let bytes = residue.iter().map(|c| c.packed_events.len() as u64).sum();
                let err = BufferError::UnflushedData { events, bytes };
                error!(%err, "data lost at close");
                Err(err)
            }
        }
    }

    /// Allocated bytes across all chunk stores. Lock-free.
    #[must_use]
    pub fn allocated_size(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.config.max_buffer_size
    }

    /// `allocated / max`, for caller-side backpressure policy. Lock-free.
    #[must_use]
    pub fn buffer_usage(&self) -> f32 {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        {
            (self.allocated_size() as f64 / self.config.max_buffer_size as f64) as f32
        }
    }

    fn policy(&self) -> FlushPolicy {
        FlushPolicy {
            size_threshold: self.config.chunk_size_threshold,
            retention: self.config.chunk_retention(),
        }
    }

    #[allow(clippy::expect_used)]
    async fn flush_locked(&self, sender: &dyn Sender, force: bool) -> Result<(), BufferError> {
        trace!(force, usage = self.buffer_usage(), "flush");
        let chunks = {
            let inner = self.inner.lock().expect("lock poisoned");
            inner.chunks(&self.policy(), force, Instant::now())
        };

        let mut first_failure = None;
        for chunk in chunks {
            match self.deliver(sender, &chunk).await {
                Ok(()) => {
                    let mut inner = self.inner.lock().expect("lock poisoned");
                    inner.complete(&chunk.tag, chunk.packed_events.len(), chunk.event_count);
                    self.allocated.store(inner.current_size(), Ordering::Release);
                    debug!(
                        tag = %chunk.tag,
                        bytes = chunk.packed_events.len(),
                        events = chunk.event_count,
                        "chunk cleared"
                    );
                }
                Err(err) => {
                    warn!(
                        tag = %chunk.tag,
                        %err,
                        "chunk delivery failed; keeping buffered bytes for the next flush"
                    );
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Attempts delivery of one chunk snapshot with retries; on exhaustion
    /// the chunk is persisted to file backup when configured. `Ok` means
    /// the snapshot is safe to release from its chunk store.
    async fn deliver(&self, sender: &dyn Sender, chunk: &Chunk) -> Result<(), BufferError> {
        let token = self.acks.as_ref().map(AckCoordinator::issue);

        let mut frame = Vec::with_capacity(chunk.packed_events.len() + chunk.tag.len() + 64);
        wire::write_chunk(
            &mut frame,
            &chunk.tag,
            &chunk.packed_events,
            token.as_ref().map(AckToken::as_bytes),
        )?;
        let metadata = ChunkMetadata {
            packed_size: chunk.packed_events.len(),
            event_count: chunk.event_count,
            ack_token: token.as_ref().map(|t| t.as_bytes().to_vec()),
        };

        let mut last_error = None;
        for attempt in 1..=self.config.send_retry_count {
            match self.try_send(sender, chunk, &frame, &metadata, token.as_ref()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let permanent = matches!(
                        &err,
                        BufferError::Send(send_err) if send_err.is_permanent()
                    );
                    warn!(tag = %chunk.tag, attempt, %err, "chunk send attempt failed");
                    last_error = Some(err);
                    if permanent {
                        break;
                    }
                }
            }
        }
        if let (Some(acks), Some(token)) = (&self.acks, &token) {
            acks.retire(token);
        }

        match &self.backup {
            Some(backup) => {
                backup.save(&chunk.tag, &chunk.packed_events)?;
                warn!(
                    tag = %chunk.tag,
                    events = chunk.event_count,
                    "chunk persisted to file backup after failed delivery"
                );
                Ok(())
            }
            // Unreachable fallback: the loop above always records an error
            // before falling through.
            None => Err(last_error.unwrap_or(BufferError::AckUnmatched)),
        }
    }

    async fn try_send(
        &self,
        sender: &dyn Sender,
        chunk: &Chunk,
        frame: &[u8],
        metadata: &ChunkMetadata,
        token: Option<&AckToken>,
    ) -> Result<(), BufferError> {
        let outcome = if token.is_some() {
            tokio::time::timeout(
                self.config.ack_timeout(),
                sender.send(&chunk.tag, frame, metadata),
            )
            .await
            .map_err(|_| BufferError::AckTimeout(self.config.ack_timeout()))??
        } else {
            sender.send(&chunk.tag, frame, metadata).await?
        };

        let Some(token) = token else {
            // Without ack mode, a successful write alone counts as
            // delivered.
            return Ok(());
        };
        let Some(payload) = outcome.ack else {
            return Err(BufferError::AckProtocol(
                "sender returned no acknowledgment payload".to_string(),
            ));
        };
        let received = wire::parse_ack(&payload)?;
        if received == token.as_bytes() {
            if let Some(acks) = &self.acks {
                acks.confirm(&received);
            }
            Ok(())
        } else {
            // A token for some other (possibly retired) chunk. Ignore it
            // and leave this chunk unconfirmed.
            Err(BufferError::AckUnmatched)
        }
    }

    #[allow(clippy::expect_used)]
    fn replay_saved_chunks(&self) -> Result<(), BufferError> {
        let Some(backup) = &self.backup else {
            return Ok(());
        };
        for path in backup.saved_files()? {
            match backup.load(&path) {
                Ok(saved) => {
                    {
                        let mut inner = self.inner.lock().expect("lock poisoned");
                        let incoming = saved.packed_events.len() as u64;
                        if inner.current_size() + incoming > self.config.max_buffer_size {
                            warn!(
                                path = %path.display(),
                                bytes = incoming,
                                "saved chunk does not fit in the buffer budget; leaving file for the next start"
                            );
                            continue;
                        }
                        inner.append(
                            &saved.tag,
                            &saved.packed_events,
                            saved.event_count,
                            Instant::now(),
                        );
                        self.allocated.store(inner.current_size(), Ordering::Release);
                    }
                    debug!(
                        path = %path.display(),
                        tag = %saved.tag,
                        events = saved.event_count,
                        "replayed saved chunk"
                    );
                    if let Err(err) = backup.remove(&path) {
                        warn!(%err, "failed to remove replayed backup file");
                    }
                }
                Err(err) => {
                    // Left in place for operator inspection; startup
                    // continues with the remaining valid files.
                    error!(%err, path = %path.display(), "failed to load backup file");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use super::*;
    use crate::error::SendError;
    use crate::sender::SendOutcome;
    use async_trait::async_trait;

    struct NullSender;

    #[async_trait]
    impl Sender for NullSender {
        async fn send(
            &self,
            _tag: &str,
            _chunk: &[u8],
            _metadata: &ChunkMetadata,
        ) -> Result<SendOutcome, SendError> {
            Ok(SendOutcome::delivered())
        }
    }

    fn small_record() -> Record {
        let mut record = Record::new();
        record.set("message", "x");
        record
    }

    fn tiny_config(max: u64) -> BufferConfig {
        BufferConfig {
            max_buffer_size: max,
            chunk_size_threshold: max,
            chunk_retention_millis: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_append_within_budget() {
        let buffer = Buffer::new(tiny_config(4096)).unwrap();
        for i in 0..10 {
            buffer.append("app.log", i * 1000, &small_record()).unwrap();
        }
        assert!(buffer.allocated_size() > 0);
        assert!(buffer.buffer_usage() <= 1.0);
    }

    #[test]
    fn test_append_over_budget_fails_and_preserves_size() {
        let buffer = Buffer::new(tiny_config(64)).unwrap();
        let mut appended = 0;
        loop {
            match buffer.append("app.log", 1000, &small_record()) {
                Ok(()) => appended += 1,
                Err(BufferError::BufferFull { allocated, max, .. }) => {
                    assert_eq!(allocated, buffer.allocated_size());
                    assert_eq!(max, 64);
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(appended > 0);
        let before = buffer.allocated_size();
        // A second overflowing append changes nothing.
        assert!(buffer.append("app.log", 1000, &small_record()).is_err());
        assert_eq!(buffer.allocated_size(), before);
    }

    #[test]
    fn test_usage_ratio() {
        let buffer = Buffer::new(tiny_config(1000)).unwrap();
        assert_eq!(buffer.buffer_usage(), 0.0);
        buffer.append("app.log", 1000, &small_record()).unwrap();
        let expected = buffer.allocated_size() as f32 / 1000.0;
        assert!((buffer.buffer_usage() - expected).abs() < f32::EPSILON);
    }

    #[test]
    fn test_encoding_error_leaves_buffer_untouched() {
        let buffer = Buffer::new(tiny_config(4096)).unwrap();
        buffer.append("app.log", 1000, &small_record()).unwrap();
        let before = buffer.allocated_size();

        // Event-time seconds overflow u32 for this timestamp.
        let result = buffer.append("app.log", i64::MAX, &small_record());
        assert!(matches!(result, Err(BufferError::Encoding(_))));
        assert_eq!(buffer.allocated_size(), before);
    }

    #[tokio::test]
    async fn test_append_and_flush_after_close_fail() {
        let buffer = Buffer::new(tiny_config(4096)).unwrap();
        buffer.close(&NullSender).await.unwrap();

        assert!(matches!(
            buffer.append("app.log", 1000, &small_record()),
            Err(BufferError::Closed)
        ));
        assert!(matches!(
            buffer.flush(&NullSender, true).await,
            Err(BufferError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let buffer = Buffer::new(tiny_config(4096)).unwrap();
        buffer.append("app.log", 1000, &small_record()).unwrap();
        buffer.close(&NullSender).await.unwrap();
        buffer.close(&NullSender).await.unwrap();
        assert_eq!(buffer.allocated_size(), 0);
    }

    #[test]
    fn test_flush_policy_size_and_age() {
        let policy = FlushPolicy {
            size_threshold: 10,
            retention: Some(Duration::from_secs(5)),
        };
        let start = Instant::now();
        let mut store = ChunkStore::new("t", start);
        store.push(b"abc", 1);

        assert!(!policy.eligible(&store, start));
        store.push(b"0123456789", 1);
        assert!(policy.eligible(&store, start));

        let mut small = ChunkStore::new("t", start);
        small.push(b"x", 1);
        assert!(policy.eligible(&small, start + Duration::from_secs(6)));
    }

    #[test]
    fn test_memory_backend_complete_removes_empty_store() {
        let mut backend = MemoryBackend::new();
        let now = Instant::now();
        backend.append("a", b"1234", 1, now);
        backend.append("b", b"56", 1, now);
        assert_eq!(backend.current_size(), 6);

        let freed = backend.complete("a", 4, 1);
        assert_eq!(freed, 4);
        assert_eq!(backend.current_size(), 2);

        let policy = FlushPolicy {
            size_threshold: 1,
            retention: None,
        };
        let chunks = backend.chunks(&policy, true, now);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tag, "b");
    }
}
