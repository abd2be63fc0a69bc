//! Reassembly of chunked inbound messages.
//!
//! Chunks are buffered per key (the session id) until the sequence is
//! complete. A sequence is dropped as soon as it breaks a rule: index out of
//! range, `totalChunks` changing midway, a repeated index, the byte cap, or
//! its age passing the reassembly timeout.

use super::codec::CodecError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// One chunk on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    #[serde(rename = "type")]
    pub message_type: String,
    pub is_chunked: bool,
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub is_chunked_complete: bool,
    pub message: String,
}

#[derive(Debug)]
struct PendingSequence {
    total_chunks: usize,
    parts: BTreeMap<usize, String>,
    bytes: usize,
    complete_flag: bool,
    started_at: Instant,
}

impl PendingSequence {
    fn new(total_chunks: usize, now: Instant) -> Self {
        Self {
            total_chunks,
            parts: BTreeMap::new(),
            bytes: 0,
            complete_flag: false,
            started_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.complete_flag && self.parts.len() == self.total_chunks
    }

    fn join(self) -> String {
        let mut payload = String::with_capacity(self.bytes);
        for part in self.parts.into_values() {
            payload.push_str(&part);
        }
        payload
    }
}

/// Process-wide chunk buffer keyed by session id.
#[derive(Debug)]
pub struct ChunkAssembler {
    max_bytes: usize,
    timeout: Duration,
    pending: Mutex<HashMap<String, PendingSequence>>,
}

impl ChunkAssembler {
    pub fn new(max_bytes: usize, timeout: Duration) -> Self {
        Self {
            max_bytes,
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer one chunk. Returns the joined payload once every chunk of the
    /// sequence has arrived and the final one carried `isChunkedComplete`.
    pub fn accept(&self, key: &str, chunk: ChunkFrame) -> Result<Option<String>, CodecError> {
        let now = Instant::now();
        let mut pending = self.pending.lock();

        if chunk.total_chunks == 0 {
            pending.remove(key);
            return Err(CodecError::InvalidChunk("totalChunks must be at least 1".into()));
        }

        if chunk.chunk_index >= chunk.total_chunks {
            pending.remove(key);
            return Err(CodecError::InvalidChunk(format!(
                "chunkIndex {} out of range for {} chunks",
                chunk.chunk_index, chunk.total_chunks
            )));
        }

        // every chunk carries at least one byte
        if chunk.total_chunks > self.max_bytes {
            pending.remove(key);
            return Err(CodecError::Oversized { limit: self.max_bytes });
        }

        let existing = pending
            .get(key)
            .map(|sequence| (sequence.started_at, sequence.total_chunks));
        if let Some((started_at, total_chunks)) = existing {
            if now.duration_since(started_at) > self.timeout {
                pending.remove(key);
                return Err(CodecError::Expired);
            }
            if total_chunks != chunk.total_chunks {
                pending.remove(key);
                return Err(CodecError::InvalidChunk(format!(
                    "totalChunks changed from {} to {}",
                    total_chunks, chunk.total_chunks
                )));
            }
        }

        let sequence = pending
            .entry(key.to_string())
            .or_insert_with(|| PendingSequence::new(chunk.total_chunks, now));

        if sequence.parts.contains_key(&chunk.chunk_index) {
            pending.remove(key);
            return Err(CodecError::InvalidChunk(format!(
                "chunkIndex {} received twice",
                chunk.chunk_index
            )));
        }

        sequence.bytes += chunk.message.len();
        if sequence.bytes > self.max_bytes {
            pending.remove(key);
            return Err(CodecError::Oversized { limit: self.max_bytes });
        }

        sequence.complete_flag |= chunk.is_chunked_complete;
        sequence.parts.insert(chunk.chunk_index, chunk.message);

        if sequence.is_complete() {
            let sequence = pending.remove(key);
            return Ok(sequence.map(PendingSequence::join));
        }

        Ok(None)
    }

    /// Forget whatever a session had buffered.
    pub fn discard(&self, key: &str) {
        self.pending.lock().remove(key);
    }

    /// Drop every sequence older than the reassembly timeout.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, sequence| now.duration_since(sequence.started_at) <= self.timeout);
        let purged = before - pending.len();
        if purged > 0 {
            tracing::warn!(purged, "Dropped expired chunk sequences");
        }
        purged
    }

    pub fn pending_sequences(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, total: usize, body: &str) -> ChunkFrame {
        ChunkFrame {
            message_type: "FILE_UPLOAD".into(),
            is_chunked: true,
            chunk_index: index,
            total_chunks: total,
            is_chunked_complete: index + 1 == total,
            message: body.into(),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_join_in_index_order() {
        let assembler = ChunkAssembler::new(1024, Duration::from_secs(30));
        assert_eq!(assembler.accept("s", chunk(2, 3, "c")).unwrap(), None);
        assert_eq!(assembler.accept("s", chunk(0, 3, "a")).unwrap(), None);
        assert_eq!(assembler.accept("s", chunk(1, 3, "b")).unwrap(), Some("abc".into()));
        assert_eq!(assembler.pending_sequences(), 0);
    }

    #[tokio::test]
    async fn test_sequences_are_isolated_by_key() {
        let assembler = ChunkAssembler::new(1024, Duration::from_secs(30));
        assembler.accept("one", chunk(0, 2, "1a")).unwrap();
        assembler.accept("two", chunk(0, 2, "2a")).unwrap();
        assert_eq!(assembler.accept("two", chunk(1, 2, "2b")).unwrap(), Some("2a2b".into()));
        assert_eq!(assembler.pending_sequences(), 1);
    }

    #[tokio::test]
    async fn test_index_out_of_range_drops_sequence() {
        let assembler = ChunkAssembler::new(1024, Duration::from_secs(30));
        assembler.accept("s", chunk(0, 2, "a")).unwrap();
        assert!(assembler.accept("s", chunk(5, 2, "x")).is_err());
        assert_eq!(assembler.pending_sequences(), 0);
    }

    #[tokio::test]
    async fn test_changed_total_drops_sequence() {
        let assembler = ChunkAssembler::new(1024, Duration::from_secs(30));
        assembler.accept("s", chunk(0, 3, "a")).unwrap();
        assert!(assembler.accept("s", chunk(1, 4, "b")).is_err());
        assert_eq!(assembler.pending_sequences(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_index_is_rejected() {
        let assembler = ChunkAssembler::new(1024, Duration::from_secs(30));
        assembler.accept("s", chunk(0, 3, "a")).unwrap();
        assert!(assembler.accept("s", chunk(0, 3, "a")).is_err());
    }

    #[tokio::test]
    async fn test_byte_cap() {
        let assembler = ChunkAssembler::new(4, Duration::from_secs(30));
        assembler.accept("s", chunk(0, 3, "abc")).unwrap();
        assert!(matches!(
            assembler.accept("s", chunk(1, 3, "de")),
            Err(CodecError::Oversized { limit: 4 })
        ));
        assert_eq!(assembler.pending_sequences(), 0);
    }

    #[tokio::test]
    async fn test_huge_total_chunks_is_rejected_without_buffering() {
        let assembler = ChunkAssembler::new(4 * 1024 * 1024, Duration::from_secs(30));

        let result = assembler.accept("s", chunk(0, 1 << 62, "a"));

        assert!(matches!(result, Err(CodecError::Oversized { .. })));
        assert_eq!(assembler.pending_sequences(), 0);
    }

    #[tokio::test]
    async fn test_large_sparse_sequence_stays_small() {
        let assembler = ChunkAssembler::new(1024, Duration::from_secs(30));
        assert_eq!(assembler.accept("s", chunk(999, 1000, "z")).unwrap(), None);
        assert_eq!(assembler.pending_sequences(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sequences_expire() {
        let assembler = ChunkAssembler::new(1024, Duration::from_secs(30));
        assembler.accept("late", chunk(0, 2, "a")).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(assembler.accept("late", chunk(1, 2, "b")), Err(CodecError::Expired)));

        assembler.accept("idle", chunk(0, 2, "a")).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(assembler.purge_expired(), 1);
        assert_eq!(assembler.pending_sequences(), 0);
    }
}
