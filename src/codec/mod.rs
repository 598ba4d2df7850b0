//! Socket Frame Codec
//!
//! Every application-level WebSocket message carries exactly one frame:
//!
//! ```text
//! <topic>|<payload>
//! ```
//!
//! The frame is split at the first delimiter, so payloads may contain `|`.
//! The topic must be UTF-8; the payload is opaque and never re-encoded.

#[cfg(test)]
mod tests;

use bytes::{BufMut, Bytes, BytesMut};

/// Separator between topic and payload
pub const DELIMITER: u8 = b'|';

/// A decoded socket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Broker topic the payload belongs to
    pub topic: String,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Encode this frame for the wire
    pub fn encode(&self) -> Bytes {
        encode(&self.topic, &self.payload)
    }
}

/// Frame decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// No `|` in the frame
    MissingDelimiter,
    /// Nothing before the delimiter
    EmptyTopic,
    /// Topic bytes are not UTF-8
    InvalidTopic,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::MissingDelimiter => write!(f, "frame has no topic delimiter"),
            FrameError::EmptyTopic => write!(f, "frame topic is empty"),
            FrameError::InvalidTopic => write!(f, "frame topic is not valid UTF-8"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Decode a frame without copying the payload
pub fn decode(data: Bytes) -> Result<Frame, FrameError> {
    let pos = data
        .iter()
        .position(|&b| b == DELIMITER)
        .ok_or(FrameError::MissingDelimiter)?;

    if pos == 0 {
        return Err(FrameError::EmptyTopic);
    }

    let topic = std::str::from_utf8(&data[..pos])
        .map_err(|_| FrameError::InvalidTopic)?
        .to_string();
    let payload = data.slice(pos + 1..);

    Ok(Frame { topic, payload })
}

/// Encode `topic|payload`
pub fn encode(topic: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(topic.len() + 1 + payload.len());
    buf.put_slice(topic.as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(payload);
    buf.freeze()
}
