//! Outbound side of a connection.
//!
//! The session layer never touches the WebSocket actor directly. It writes
//! [`OutboundFrame`]s to a [`FrameSink`]; the actor implements the sink by
//! forwarding frames to its own mailbox. [`Outbox`] sits on top and turns
//! protocol messages into (possibly chunked) text frames.

use crate::pipeline::ResultEmitter;
use crate::protocol::{MessageCodec, WireMessage};
use crate::state::RelayMetrics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// WebSocket close status used when the server ends a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Client CLOSE or idle timeout (1000).
    Normal,
    /// Peer stopped answering (1001).
    Away,
    /// Fatal error (1011).
    Error,
    /// Oversized or malformed input the server refuses to process (1008).
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping(Vec<u8>),
    Close { code: CloseCode, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transport is closed")]
pub struct TransportClosed;

/// Accepts frames for one connection.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportClosed>;

    fn is_open(&self) -> bool;
}

/// Serializes messages onto a sink.
pub struct Outbox {
    sink: Arc<dyn FrameSink>,
    codec: Arc<MessageCodec>,
    metrics: Arc<RelayMetrics>,
    // keeps the chunks of one message contiguous
    send_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Outbox {
    pub fn new(sink: Arc<dyn FrameSink>, codec: Arc<MessageCodec>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            sink,
            codec,
            metrics,
            send_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn send(&self, message: &WireMessage) -> Result<(), TransportClosed> {
        if !self.is_open() {
            return Err(TransportClosed);
        }

        let frames = match self.codec.encode(message) {
            Ok(frames) => frames,
            Err(err) => {
                error!(message_type = message.type_name(), error = %err, "Could not encode outbound message");
                return Ok(());
            }
        };
        if frames.len() > 1 {
            debug!(message_type = message.type_name(), chunks = frames.len(), "Sending chunked message");
        }

        let _guard = self.send_lock.lock();
        for frame in frames {
            self.sink.send(OutboundFrame::Text(frame))?;
            RelayMetrics::incr(&self.metrics.frames_out);
        }
        Ok(())
    }

    /// WebSocket-level ping followed by a protocol `PING`.
    pub fn heartbeat(&self) -> Result<(), TransportClosed> {
        if !self.is_open() {
            return Err(TransportClosed);
        }
        self.sink.send(OutboundFrame::Ping(Vec::new()))?;
        self.send(&WireMessage::ping_now())
    }

    /// Send a close frame once. Later calls do nothing.
    pub fn close(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sink.send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Stop sending without a close frame; the transport is already gone.
    pub fn detach(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.sink.is_open()
    }
}

impl ResultEmitter for Outbox {
    fn emit(&self, message: WireMessage) -> bool {
        self.send(&message).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChunkAssembler;
    use crate::providers::testing::RecordingSink;
    use std::time::Duration;

    fn outbox(sink: &Arc<RecordingSink>, max_message_bytes: usize, chunk_bytes: usize) -> Outbox {
        Outbox::new(
            sink.clone(),
            Arc::new(MessageCodec::with_limits(max_message_bytes, chunk_bytes)),
            Arc::new(RelayMetrics::default()),
        )
    }

    #[test]
    fn test_small_message_is_one_frame() {
        let sink = RecordingSink::new();
        let outbox = outbox(&sink, 1024, 512);

        outbox.send(&WireMessage::text_result("hi", false)).unwrap();

        assert_eq!(sink.messages(), vec![WireMessage::text_result("hi", false)]);
    }

    #[test]
    fn test_large_message_is_chunked_and_reassembles() {
        let sink = RecordingSink::new();
        let outbox = outbox(&sink, 64, 32);
        let message = WireMessage::translation("多字节文本 ".repeat(20), false);

        outbox.send(&message).unwrap();

        let frames = sink.frames();
        assert!(frames.len() > 1);
        let codec = MessageCodec::with_limits(64, 32);
        let assembler = ChunkAssembler::new(1 << 20, Duration::from_secs(30));
        let mut payload = None;
        for frame in frames {
            let OutboundFrame::Text(text) = frame else { panic!("expected text frame") };
            match codec.decode(&text).unwrap() {
                crate::protocol::Inbound::Chunk(chunk) => {
                    payload = assembler.accept("client", chunk).unwrap().or(payload);
                }
                other => panic!("expected chunk, got {:?}", other),
            }
        }
        let decoded = codec.decode_reassembled(&payload.unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_close_is_sent_once_and_blocks_further_sends() {
        let sink = RecordingSink::new();
        let outbox = outbox(&sink, 1024, 512);

        outbox.close(CloseCode::Normal, "bye");
        outbox.close(CloseCode::Error, "again");

        assert_eq!(
            sink.frames(),
            vec![OutboundFrame::Close { code: CloseCode::Normal, reason: "bye".into() }]
        );
        assert_eq!(outbox.send(&WireMessage::completion(false)), Err(TransportClosed));
        assert!(!outbox.emit(WireMessage::completion(false)));
    }

    #[test]
    fn test_heartbeat_sends_ws_ping_and_protocol_ping() {
        let sink = RecordingSink::new();
        let outbox = outbox(&sink, 1024, 512);

        outbox.heartbeat().unwrap();

        assert_eq!(sink.pings(), 1);
        assert!(matches!(sink.messages()[0], WireMessage::Ping { timestamp: Some(_) }));
    }

    #[test]
    fn test_broken_sink_reports_closed() {
        let sink = RecordingSink::new();
        let outbox = outbox(&sink, 1024, 512);
        sink.fail_sends();

        assert!(outbox.heartbeat().is_err());
        assert!(!outbox.is_open());
    }
}
