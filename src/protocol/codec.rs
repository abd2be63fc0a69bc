//! # Message Codec
//!
//! Turns [`WireMessage`] values into text frames and back.
//!
//! A serialized message larger than `max_message_bytes` is split into
//! chunk frames. Each chunk frame carries a slice of the serialized JSON in
//! its `message` field:
//!
//! ```json
//! {"type":"AUDIO_RESULT","isChunked":true,"chunkIndex":0,"totalChunks":3,
//!  "isChunkedComplete":false,"message":"{\"type\":\"AUDIO_RESULT\",\"audio\":\"UklG..."}
//! ```
//!
//! Slices never exceed `chunk_bytes` and always end on a UTF-8 character
//! boundary. Concatenating the slices in index order gives back the original
//! JSON text.

use super::assembler::ChunkFrame;
use super::message::WireMessage;
use crate::config::CodecConfig;
use crate::error::SessionError;
use serde::Deserialize;

/// Smallest chunk that can always hold one UTF-8 code point.
pub const MIN_CHUNK_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("chunk sequence exceeds {limit} bytes")]
    Oversized { limit: usize },

    #[error("chunk sequence expired before completion")]
    Expired,
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// What one inbound text frame turned out to be.
#[derive(Debug)]
pub enum Inbound {
    Message(WireMessage),
    Chunk(ChunkFrame),
}

/// Only used to tell chunk frames apart before committing to a full decode.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkHeader {
    #[serde(default)]
    is_chunked: bool,
}

#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_message_bytes: usize,
    chunk_bytes: usize,
}

impl MessageCodec {
    pub fn new(config: &CodecConfig) -> Self {
        Self::with_limits(config.max_message_bytes, config.chunk_bytes)
    }

    /// Chunk sizes below [`MIN_CHUNK_BYTES`] are raised to it.
    pub fn with_limits(max_message_bytes: usize, chunk_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            chunk_bytes: chunk_bytes.max(MIN_CHUNK_BYTES),
        }
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Serialize a message into one frame, or several chunk frames when it is
    /// larger than the message threshold.
    pub fn encode(&self, message: &WireMessage) -> Result<Vec<String>, CodecError> {
        let json = serde_json::to_string(message)?;
        if json.len() <= self.max_message_bytes {
            return Ok(vec![json]);
        }

        let frames = self.split(message.type_name(), &json)?;
        tracing::debug!(
            message_type = message.type_name(),
            bytes = json.len(),
            chunks = frames.len(),
            "Split oversized message"
        );
        Ok(frames)
    }

    fn split(&self, type_name: &str, json: &str) -> Result<Vec<String>, CodecError> {
        let slices = split_utf8(json, self.chunk_bytes);
        let total = slices.len();
        slices
            .into_iter()
            .enumerate()
            .map(|(index, slice)| {
                let frame = ChunkFrame {
                    message_type: type_name.to_string(),
                    is_chunked: true,
                    chunk_index: index,
                    total_chunks: total,
                    is_chunked_complete: index + 1 == total,
                    message: slice.to_string(),
                };
                serde_json::to_string(&frame).map_err(CodecError::from)
            })
            .collect()
    }

    /// Decode one inbound text frame.
    pub fn decode(&self, raw: &str) -> Result<Inbound, CodecError> {
        let header: ChunkHeader = serde_json::from_str(raw)?;
        if header.is_chunked {
            let frame: ChunkFrame = serde_json::from_str(raw)?;
            return Ok(Inbound::Chunk(frame));
        }
        Ok(Inbound::Message(serde_json::from_str(raw)?))
    }

    /// Decode the concatenated payload of a completed chunk sequence.
    /// A payload that is itself a chunk frame is rejected.
    pub fn decode_reassembled(&self, payload: &str) -> Result<WireMessage, CodecError> {
        match self.decode(payload)? {
            Inbound::Message(message) => Ok(message),
            Inbound::Chunk(_) => Err(CodecError::InvalidChunk(
                "reassembled payload is itself a chunk".into(),
            )),
        }
    }
}

/// Split `text` into slices of at most `max_bytes` bytes, cutting only on
/// character boundaries.
///
/// A `max_bytes` smaller than the next character still makes progress by
/// emitting that character whole.
pub fn split_utf8(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(1);
    let mut slices = Vec::with_capacity(text.len() / max_bytes + 1);
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_bytes).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !text.is_char_boundary(end) {
                end += 1;
            }
        }
        slices.push(&text[start..end]);
        start = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::assembler::ChunkAssembler;
    use std::time::Duration;

    fn big_text_result(len: usize) -> WireMessage {
        // mixes 1, 2, 3 and 4 byte characters
        let pattern = "a£語🎧";
        let text: String = pattern.chars().cycle().take(len).collect();
        WireMessage::text_result(text, false)
    }

    #[test]
    fn test_small_message_is_single_frame() {
        let codec = MessageCodec::with_limits(1024, 512);
        let frames = codec.encode(&WireMessage::ping_now()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].contains("isChunked"));
    }

    #[test]
    fn test_split_never_cuts_a_code_point() {
        let text = "héllo 世界 🎧🎧 done";
        for max in 1..=12 {
            let slices = split_utf8(text, max);
            assert_eq!(slices.concat(), text);
            for slice in &slices {
                if max >= MIN_CHUNK_BYTES {
                    assert!(slice.len() <= max, "slice {:?} exceeds {}", slice, max);
                }
            }
        }
    }

    #[test]
    fn test_chunk_flags() {
        let codec = MessageCodec::with_limits(256, 100);
        let frames = codec.encode(&big_text_result(300)).unwrap();
        assert!(frames.len() > 1);

        let decoded: Vec<ChunkFrame> = frames
            .iter()
            .map(|f| match codec.decode(f).unwrap() {
                Inbound::Chunk(c) => c,
                Inbound::Message(m) => panic!("expected chunk, got {:?}", m),
            })
            .collect();

        for (i, chunk) in decoded.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.total_chunks, decoded.len());
            assert_eq!(chunk.message_type, "TEXT_RESULT");
            assert_eq!(chunk.is_chunked_complete, i + 1 == decoded.len());
            assert!(chunk.message.len() <= 100);
        }
    }

    #[tokio::test]
    async fn test_reassemble_split_round_trip_across_chunk_sizes() {
        let message = big_text_result(700);
        for chunk_bytes in [4, 5, 7, 16, 63, 256, 1000] {
            let codec = MessageCodec::with_limits(64, chunk_bytes);
            let assembler = ChunkAssembler::new(1 << 20, Duration::from_secs(30));
            let mut result = None;

            for frame in codec.encode(&message).unwrap() {
                let Inbound::Chunk(chunk) = codec.decode(&frame).unwrap() else {
                    panic!("expected chunk frame");
                };
                if let Some(payload) = assembler.accept("session-1", chunk).unwrap() {
                    result = Some(codec.decode_reassembled(&payload).unwrap());
                }
            }

            assert_eq!(result.as_ref(), Some(&message), "chunk size {}", chunk_bytes);
            assert_eq!(assembler.pending_sequences(), 0);
        }
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        let codec = MessageCodec::with_limits(1024, 512);
        let err = codec.decode("{not json").unwrap_err();
        let session_err: SessionError = err.into();
        assert!(matches!(session_err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_chunk_size_floor() {
        let codec = MessageCodec::with_limits(1024, 1);
        assert_eq!(codec.chunk_bytes(), MIN_CHUNK_BYTES);
    }
}
