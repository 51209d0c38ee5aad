//! Common test utilities: a scriptable in-process mock collector.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use fluent_forward::{
    wire, ChunkMetadata, Record, SendError, SendOutcome, Sender,
};

/// What the collector should do with the next incoming chunk.
#[derive(Debug, Clone, Copy)]
pub enum SendScript {
    /// Accept the chunk and, when it carries an ack token, echo it back.
    Deliver,
    /// Fail with a transient transport error.
    Transient,
    /// Fail with a permanent transport error.
    Permanent,
    /// Accept the bytes but answer with a token for some other chunk.
    WrongAck,
    /// Accept the bytes but never answer the acknowledgment.
    NoAck,
    /// Never complete the send at all; the caller's timeout must fire.
    Stall,
}

/// In-process mock collector.
///
/// Every incoming chunk frame is decoded and validated against the forward
/// protocol before the scripted behavior is applied; once the script runs
/// out, every chunk is delivered.
#[derive(Debug, Default)]
pub struct MockCollector {
    script: Mutex<VecDeque<SendScript>>,
    received: Mutex<Vec<wire::ChunkFrame>>,
    attempts: Mutex<usize>,
}

impl MockCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<SendScript>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Chunk frames that were accepted (scripted failures excluded).
    pub fn received(&self) -> Vec<wire::ChunkFrame> {
        self.received.lock().unwrap().clone()
    }

    /// Total send attempts observed, including scripted failures.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    /// All events accepted for `tag`, across every received chunk.
    pub fn events_for(&self, tag: &str) -> Vec<(i64, Record)> {
        self.received()
            .iter()
            .filter(|frame| frame.tag == tag)
            .flat_map(|frame| wire::decode_packed_events(&frame.packed_events).unwrap())
            .collect()
    }
}

#[async_trait]
impl Sender for MockCollector {
    async fn send(
        &self,
        tag: &str,
        chunk: &[u8],
        metadata: &ChunkMetadata,
    ) -> Result<SendOutcome, SendError> {
        *self.attempts.lock().unwrap() += 1;

        // Validate the frame the way a real collector would.
        let frame = wire::parse_chunk(chunk).expect("chunk frame must decode");
        assert_eq!(frame.tag, tag, "frame tag must match the tag argument");
        assert_eq!(
            frame.declared_size as usize,
            frame.packed_events.len(),
            "size option must match the packed events length"
        );
        assert_eq!(
            frame.ack_token, metadata.ack_token,
            "option metadata must carry the same token as the frame"
        );

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendScript::Deliver);

        match behavior {
            SendScript::Deliver => {
                let outcome = match &frame.ack_token {
                    Some(token) => {
                        let mut ack = Vec::new();
                        wire::write_ack(&mut ack, token).unwrap();
                        SendOutcome::with_ack(ack)
                    }
                    None => SendOutcome::delivered(),
                };
                self.received.lock().unwrap().push(frame);
                Ok(outcome)
            }
            SendScript::Transient => Err(SendError::Transient(
                "scripted transient failure".to_string(),
            )),
            SendScript::Permanent => Err(SendError::Permanent(
                "scripted permanent failure".to_string(),
            )),
            SendScript::WrongAck => {
                let mut ack = Vec::new();
                wire::write_ack(&mut ack, &[0_u8; 16]).unwrap();
                Ok(SendOutcome::with_ack(ack))
            }
            SendScript::NoAck => Ok(SendOutcome::delivered()),
            SendScript::Stall => {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(SendOutcome::delivered())
            }
        }
    }
}
