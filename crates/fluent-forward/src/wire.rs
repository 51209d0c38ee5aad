//! Fluentd forward wire protocol primitives.
//!
//! Everything here must stay bit-compatible with the standard forward
//! collector protocol:
//!
//! - a chunk is the MessagePack array `[tag, packed_events, option]`
//! - `packed_events` is a concatenation of `[timestamp, record]` pairs,
//!   where `timestamp` is either a plain integer (seconds since epoch) or
//!   ext type `0` carrying big-endian u32 seconds followed by u32
//!   nanoseconds (Fluentd event-time)
//! - `option` always maps `"size"` to the byte length of `packed_events`,
//!   and `"chunk"` to the ack token when ack mode is active
//! - the acknowledgment read back from the peer is the one-entry map
//!   `{"ack": <token>}`

use rmpv::Value;

use crate::error::BufferError;
use crate::record::Record;

/// MessagePack ext type code for Fluentd event-time.
pub const EVENT_TIME_EXT_TYPE: i8 = 0;

/// Option key carrying the `packed_events` byte length.
pub const OPTION_SIZE_KEY: &str = "size";

/// Option key carrying the ack token in ack-response mode.
pub const OPTION_CHUNK_KEY: &str = "chunk";

/// Key of the one-entry acknowledgment response map.
pub const ACK_KEY: &str = "ack";

/// How event timestamps are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// Plain integer seconds since epoch. Sub-second precision is lost.
    Seconds,
    /// Ext type `0` event-time: big-endian u32 seconds + u32 nanoseconds.
    /// Lossless down to the nanosecond.
    EventTime,
}

fn encoding_err(err: impl std::fmt::Display) -> BufferError {
    BufferError::Encoding(err.to_string())
}

/// Appends one encoded `[timestamp, record]` pair to `out`.
pub fn write_event(
    out: &mut Vec<u8>,
    timestamp_millis: i64,
    record: &Record,
    format: TimestampFormat,
) -> Result<(), BufferError> {
    rmp::encode::write_array_len(out, 2).map_err(encoding_err)?;

    let seconds = timestamp_millis.div_euclid(1000);
    match format {
        TimestampFormat::Seconds => {
            rmp::encode::write_sint(out, seconds).map_err(encoding_err)?;
        }
        TimestampFormat::EventTime => {
            let seconds = u32::try_from(seconds)
                .map_err(|_| encoding_err("timestamp out of event-time range"))?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let nanos = (timestamp_millis.rem_euclid(1000) * 1_000_000) as u32;
            rmp::encode::write_ext_meta(out, 8, EVENT_TIME_EXT_TYPE).map_err(encoding_err)?;
            out.extend_from_slice(&seconds.to_be_bytes());
            out.extend_from_slice(&nanos.to_be_bytes());
        }
    }

    let len = u32::try_from(record.len()).map_err(|_| encoding_err("record has too many keys"))?;
    rmp::encode::write_map_len(out, len).map_err(encoding_err)?;
    for (key, value) in record.iter() {
        rmp::encode::write_str(out, key).map_err(encoding_err)?;
        rmpv::encode::write_value(out, value).map_err(encoding_err)?;
    }
    Ok(())
}

/// Frames a complete chunk: `[tag, packed_events, option]`.
///
/// `ack_token` is embedded under the `"chunk"` option key when present.
pub fn write_chunk(
    out: &mut Vec<u8>,
    tag: &str,
    packed_events: &[u8],
    ack_token: Option<&[u8]>,
) -> Result<(), BufferError> {
    rmp::encode::write_array_len(out, 3).map_err(encoding_err)?;
    rmp::encode::write_str(out, tag).map_err(encoding_err)?;
    rmp::encode::write_bin(out, packed_events).map_err(encoding_err)?;

    let option_len = if ack_token.is_some() { 2 } else { 1 };
    rmp::encode::write_map_len(out, option_len).map_err(encoding_err)?;
    rmp::encode::write_str(out, OPTION_SIZE_KEY).map_err(encoding_err)?;
    rmp::encode::write_uint(out, packed_events.len() as u64).map_err(encoding_err)?;
    if let Some(token) = ack_token {
        rmp::encode::write_str(out, OPTION_CHUNK_KEY).map_err(encoding_err)?;
        rmp::encode::write_bin(out, token).map_err(encoding_err)?;
    }
    Ok(())
}

/// Encodes the `{"ack": <token>}` response a collector writes back.
pub fn write_ack(out: &mut Vec<u8>, token: &[u8]) -> Result<(), BufferError> {
    rmp::encode::write_map_len(out, 1).map_err(encoding_err)?;
    rmp::encode::write_str(out, ACK_KEY).map_err(encoding_err)?;
    rmp::encode::write_bin(out, token).map_err(encoding_err)?;
    Ok(())
}

/// Parses an acknowledgment response, returning the echoed token bytes.
///
/// Any shape other than a one-entry `{"ack": <bin|str>}` map is a protocol
/// error.
pub fn parse_ack(bytes: &[u8]) -> Result<Vec<u8>, BufferError> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| BufferError::AckProtocol(e.to_string()))?;
    let Value::Map(entries) = value else {
        return Err(BufferError::AckProtocol("response is not a map".to_string()));
    };
    if entries.len() != 1 {
        return Err(BufferError::AckProtocol(format!(
            "expected a one-entry map, got {} entries",
            entries.len()
        )));
    }
    let (key, value) = &entries[0];
    if key.as_str() != Some(ACK_KEY) {
        return Err(BufferError::AckProtocol(format!(
            "unexpected response key: {key}"
        )));
    }
    match value {
        Value::Binary(token) => Ok(token.clone()),
        Value::String(s) => s
            .as_str()
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| BufferError::AckProtocol("ack token is not valid UTF-8".to_string())),
        other => Err(BufferError::AckProtocol(format!(
            "ack token has unexpected type: {other}"
        ))),
    }
}

/// A chunk frame decoded back into its parts. Used by collector-side code
/// and by tests that verify what a sender was handed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFrame {
    pub tag: String,
    pub packed_events: Vec<u8>,
    /// Value of the `"size"` option key.
    pub declared_size: u64,
    /// Value of the `"chunk"` option key, when present.
    pub ack_token: Option<Vec<u8>>,
}

/// Decodes a chunk frame produced by [`write_chunk`].
pub fn parse_chunk(bytes: &[u8]) -> Result<ChunkFrame, BufferError> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor).map_err(encoding_err)?;
    let Value::Array(parts) = value else {
        return Err(encoding_err("chunk frame is not an array"));
    };
    let [tag, events, option] = parts.as_slice() else {
        return Err(encoding_err("chunk frame is not a 3-element array"));
    };

    let tag = tag
        .as_str()
        .ok_or_else(|| encoding_err("chunk tag is not a string"))?
        .to_string();
    let Value::Binary(packed_events) = events else {
        return Err(encoding_err("packed events are not a binary value"));
    };
    let Value::Map(option) = option else {
        return Err(encoding_err("chunk option is not a map"));
    };

    let mut declared_size = None;
    let mut ack_token = None;
    for (key, value) in option {
        match key.as_str() {
            Some(OPTION_SIZE_KEY) => declared_size = value.as_u64(),
            Some(OPTION_CHUNK_KEY) => {
                if let Value::Binary(token) = value {
                    ack_token = Some(token.clone());
                }
            }
            _ => {}
        }
    }
    let declared_size =
        declared_size.ok_or_else(|| encoding_err("chunk option is missing the size key"))?;

    Ok(ChunkFrame {
        tag,
        packed_events: packed_events.clone(),
        declared_size,
        ack_token,
    })
}

/// Decodes a `packed_events` blob back into `(timestamp_millis, record)`
/// pairs. Also used to validate saved buffer files before replay.
pub fn decode_packed_events(bytes: &[u8]) -> Result<Vec<(i64, Record)>, BufferError> {
    let mut events = Vec::new();
    let mut cursor = bytes;
    while !cursor.is_empty() {
        let value = rmpv::decode::read_value(&mut cursor).map_err(encoding_err)?;
        let Value::Array(pair) = value else {
            return Err(encoding_err("event is not an array"));
        };
        let [timestamp, record] = pair.as_slice() else {
            return Err(encoding_err("event is not a 2-element array"));
        };

        let timestamp_millis = decode_timestamp(timestamp)?;
        let Value::Map(entries) = record else {
            return Err(encoding_err("event record is not a map"));
        };
        let mut decoded = Record::new();
        for (key, value) in entries {
            let key = key
                .as_str()
                .ok_or_else(|| encoding_err("record key is not a string"))?;
            decoded.set(key, value.clone());
        }
        events.push((timestamp_millis, decoded));
    }
    Ok(events)
}

fn decode_timestamp(value: &Value) -> Result<i64, BufferError> {
    match value {
        Value::Integer(seconds) => seconds
            .as_i64()
            .and_then(|s| s.checked_mul(1000))
            .ok_or_else(|| encoding_err("timestamp seconds out of range")),
        Value::Ext(EVENT_TIME_EXT_TYPE, data) if data.len() == 8 => {
            let seconds = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let nanos = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            Ok(i64::from(seconds) * 1000 + i64::from(nanos) / 1_000_000)
        }
        other => Err(encoding_err(format!("unexpected timestamp value: {other}"))),
    }
}
