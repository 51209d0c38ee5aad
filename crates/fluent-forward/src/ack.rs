//! Ack-response mode token bookkeeping.
//!
//! When ack-response mode is active, every outgoing chunk carries a fresh
//! unique token in its option metadata and stays buffered until the remote
//! peer echoes that exact token back. The coordinator tracks which tokens
//! are still waiting on confirmation; tokens from already-retired chunks
//! are ignored rather than treated as errors.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use rand::RngCore;
use tracing::debug;

/// Number of random bytes in an ack token.
const TOKEN_LEN: usize = 16;

/// Opaque unique token attached to one outgoing chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(Vec<u8>);

impl AckToken {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Tracks tokens for chunks awaiting acknowledgment.
#[derive(Debug, Default)]
pub struct AckCoordinator {
    pending: Mutex<HashMap<Vec<u8>, Instant>>,
}

impl AckCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh unique token and registers it as pending.
    #[allow(clippy::expect_used)]
    pub fn issue(&self) -> AckToken {
        let mut bytes = vec![0_u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.pending
            .lock()
            .expect("lock poisoned")
            .insert(bytes.clone(), Instant::now());
        AckToken(bytes)
    }

    /// Confirms a token echoed by the peer. Returns `true` if it matched a
    /// pending chunk; unknown or stale tokens are ignored and return
    /// `false`.
    #[allow(clippy::expect_used)]
    pub fn confirm(&self, token: &[u8]) -> bool {
        let removed = self
            .pending
            .lock()
            .expect("lock poisoned")
            .remove(token)
            .is_some();
        if !removed {
            debug!("ignoring acknowledgment for unknown or already-retired chunk");
        }
        removed
    }

    /// Drops a pending token without confirmation, e.g. after the chunk was
    /// handed to file backup or its retries were exhausted.
    #[allow(clippy::expect_used)]
    pub fn retire(&self, token: &AckToken) {
        self.pending.lock().expect("lock poisoned").remove(&token.0);
    }

    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }
}
