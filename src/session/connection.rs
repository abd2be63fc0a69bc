//! Per-connection message handling.
//!
//! A [`Connection`] is created when a socket opens and receives every frame
//! the transport delivers. It decodes text frames (reassembling chunked
//! ones), drives the session state machine and starts pipelines. Pipelines
//! run on their own tokio task so the connection keeps answering PINGs and
//! CLOSE while audio is processed.

use super::registry::{SessionRecord, SessionRegistry};
use super::transport::{CloseCode, FrameSink, Outbox};
use crate::error::SessionError;
use crate::pipeline::{PipelineOrchestrator, PipelineOutcome, PipelineRequest, ResultEmitter};
use crate::protocol::{Inbound, MessageCodec, TranslationConfig, WireMessage};
use crate::state::RelayMetrics;
use base64::Engine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Forwards pipeline results to the session outbox and frees the pipeline
/// slot just before the completion marker goes out. A client may send its
/// next audio frame as soon as it sees completion.
struct SlotReleasingEmitter<'a> {
    record: &'a SessionRecord,
    released: AtomicBool,
}

impl<'a> SlotReleasingEmitter<'a> {
    fn new(record: &'a SessionRecord) -> Self {
        Self {
            record,
            released: AtomicBool::new(false),
        }
    }

    /// Free the slot once. Later calls must not free a slot the next
    /// pipeline has since claimed.
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.record.finish_pipeline();
        }
    }
}

impl ResultEmitter for SlotReleasingEmitter<'_> {
    fn emit(&self, message: WireMessage) -> bool {
        if message.is_completion() {
            self.release();
        }
        self.record.outbox().emit(message)
    }
}

/// Shared services a connection needs.
#[derive(Clone)]
pub struct SessionServices {
    pub registry: Arc<SessionRegistry>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub codec: Arc<MessageCodec>,
    pub metrics: Arc<RelayMetrics>,
}

pub struct Connection {
    services: SessionServices,
    record: Arc<SessionRecord>,
}

impl Connection {
    /// Create and register a session for a freshly opened socket.
    pub fn open(services: SessionServices, sink: Arc<dyn FrameSink>) -> Self {
        let id = Uuid::new_v4().to_string();
        let outbox = Outbox::new(sink, Arc::clone(&services.codec), Arc::clone(&services.metrics));
        let record = Arc::new(SessionRecord::new(id, outbox));

        services.registry.add(Arc::clone(&record));
        RelayMetrics::incr(&services.metrics.sessions_opened);
        info!(session_id = %record.id, sessions = services.registry.len(), "Translation session opened");

        Self { services, record }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &Arc<SessionRecord> {
        &self.record
    }

    /// Handle one text frame. Returns the pipeline it started, if any.
    pub fn on_text(&self, raw: &str) -> Option<JoinHandle<PipelineOutcome>> {
        RelayMetrics::incr(&self.services.metrics.frames_in);

        let decoded = self.decode(raw);
        // heartbeat answers are not client activity
        let heartbeat = matches!(decoded, Ok(Some(WireMessage::Pong { .. })));
        if !heartbeat {
            self.record.touch();
        }

        let message = match decoded {
            Ok(Some(message)) => message,
            Ok(None) => return None,
            Err(err) => {
                self.report(&err);
                return None;
            }
        };

        debug!(session_id = %self.record.id, message_type = message.type_name(), "Received message");
        if !heartbeat && self.record.state().is_live() {
            self.record.mark_active();
        }
        self.dispatch(message)
    }

    /// Decode a frame. `Ok(None)` means a chunk was buffered and the
    /// message is not complete yet.
    fn decode(&self, raw: &str) -> Result<Option<WireMessage>, SessionError> {
        match self.services.codec.decode(raw)? {
            Inbound::Message(message) => Ok(Some(message)),
            Inbound::Chunk(chunk) => {
                let index = chunk.chunk_index;
                match self.services.registry.chunks().accept(&self.record.id, chunk)? {
                    Some(payload) => Ok(Some(self.services.codec.decode_reassembled(&payload)?)),
                    None => {
                        debug!(session_id = %self.record.id, chunk_index = index, "Buffered inbound chunk");
                        Ok(None)
                    }
                }
            }
        }
    }

    fn dispatch(&self, message: WireMessage) -> Option<JoinHandle<PipelineOutcome>> {
        match message {
            WireMessage::Init { config: Some(config), .. } => self.on_init(config),
            WireMessage::Init { config: None, .. } => {
                self.report(&SessionError::Validation("INIT requires a config".into()))
            }
            WireMessage::Ping { .. } => self.send(&WireMessage::Pong {
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
            }),
            WireMessage::Pong { .. } => self.record.pong_received(),
            WireMessage::Close { .. } => self.close(CloseCode::Normal, "client closed"),
            WireMessage::FileUpload {
                config,
                audio,
                filename,
                ..
            } => return self.on_file_upload(config, audio, filename),
            other => self.report(&SessionError::Protocol(format!(
                "{} cannot be sent by a client",
                other.type_name()
            ))),
        }
        None
    }

    fn on_init(&self, config: TranslationConfig) {
        if let Err(err) = config.validate() {
            self.report(&err);
            return;
        }

        match self.record.initialize(config) {
            Ok(config) => {
                info!(
                    session_id = %self.record.id,
                    source = %config.source_language,
                    target = %config.target_language,
                    provider = config.provider.as_deref().unwrap_or("default"),
                    mode = ?config.mode,
                    return_audio = config.return_audio,
                    "Session initialized"
                );
                self.send(&WireMessage::Init {
                    config: Some((*config).clone()),
                    message: Some("session initialized".into()),
                });
            }
            Err(err) => self.report(&err),
        }
    }

    /// Handle one binary frame of audio.
    pub fn on_binary(&self, audio: Vec<u8>) -> Option<JoinHandle<PipelineOutcome>> {
        RelayMetrics::incr(&self.services.metrics.frames_in);

        let Some(config) = self.record.config() else {
            self.report(&SessionError::NotInitialized);
            return None;
        };
        self.record.mark_active();

        if !self.claim_pipeline() {
            return None;
        }
        Some(self.spawn_pipeline(audio, config, false))
    }

    fn on_file_upload(
        &self,
        config: Option<TranslationConfig>,
        audio: Option<String>,
        filename: Option<String>,
    ) -> Option<JoinHandle<PipelineOutcome>> {
        let config = match config {
            Some(config) => {
                if let Err(err) = config.validate() {
                    self.report(&err);
                    return None;
                }
                Arc::new(config)
            }
            None => match self.record.config() {
                Some(config) => config,
                None => {
                    self.report(&SessionError::NotInitialized);
                    return None;
                }
            },
        };

        if !self.claim_pipeline() {
            return None;
        }

        info!(
            session_id = %self.record.id,
            filename = filename.as_deref().unwrap_or("unnamed"),
            "File upload received"
        );
        self.send(&WireMessage::progress(10, "decoding audio", false));

        let audio = match decode_upload(audio.as_deref().unwrap_or_default()) {
            Ok(audio) => audio,
            Err(err) => {
                self.record.finish_pipeline();
                self.report(&err);
                return None;
            }
        };

        self.send(&WireMessage::progress(30, "recognizing and translating", false));
        Some(self.spawn_pipeline(audio, config, true))
    }

    fn claim_pipeline(&self) -> bool {
        match self.record.try_start_pipeline() {
            Ok(()) => true,
            Err(err) => {
                self.report(&err);
                false
            }
        }
    }

    /// Run a pipeline on its own task. The pipeline slot must already be claimed.
    fn spawn_pipeline(
        &self,
        audio: Vec<u8>,
        config: Arc<TranslationConfig>,
        is_file_upload: bool,
    ) -> JoinHandle<PipelineOutcome> {
        let record = Arc::clone(&self.record);
        let registry = Arc::clone(&self.services.registry);
        let orchestrator = Arc::clone(&self.services.orchestrator);
        let cancel = record.cancel_token().child_token();

        tokio::spawn(async move {
            let request = PipelineRequest {
                session_id: &record.id,
                audio: &audio,
                config: &config,
                is_file_upload,
            };
            let emitter = SlotReleasingEmitter::new(&record);
            let outcome = orchestrator.run(request, &emitter, &cancel).await;
            emitter.release();

            if is_file_upload {
                let outbox = record.outbox();
                if outcome.is_success() {
                    let _ = outbox.send(&WireMessage::progress(90, "results ready", false));
                    let _ = outbox.send(&WireMessage::progress(100, "upload processed", true));
                } else if outcome != PipelineOutcome::Cancelled {
                    let _ = outbox.send(&WireMessage::progress(100, "upload failed", true));
                }
            }

            if let Some(err) = outcome.fatal_error() {
                warn!(session_id = %record.id, error = %err, "Fatal pipeline error, closing session");
                registry.close_session(&record.id, Some((CloseCode::Error, "provider unavailable")));
            }
            outcome
        })
    }

    /// A WebSocket-level pong.
    pub fn on_pong(&self) {
        self.record.pong_received();
    }

    /// The transport failed. Report it if we still can, then close.
    pub fn on_transport_error(&self, reason: &str) {
        warn!(session_id = %self.record.id, reason, "Transport error");
        self.report(&SessionError::Transport(reason.to_string()));
        self.services
            .registry
            .close_session(&self.record.id, Some((CloseCode::Error, "transport error")));
    }

    /// The socket is gone. Runs exactly once per connection.
    pub fn on_closed(&self) {
        self.services.registry.close_session(&self.record.id, None);
        RelayMetrics::incr(&self.services.metrics.sessions_closed);
        debug!(session_id = %self.record.id, sessions = self.services.registry.len(), "Translation session ended");
    }

    fn close(&self, code: CloseCode, reason: &str) {
        self.services.registry.close_session(&self.record.id, Some((code, reason)));
    }

    fn send(&self, message: &WireMessage) {
        if self.record.outbox().send(message).is_err() {
            debug!(session_id = %self.record.id, message_type = message.type_name(), "Dropped message for closed transport");
        }
    }

    fn report(&self, err: &SessionError) {
        warn!(session_id = %self.record.id, code = ?err.code(), error = %err, "Session error");
        self.send(&WireMessage::error(err));
    }
}

/// Decode base64 upload audio, accepting a `data:` URL prefix.
fn decode_upload(encoded: &str) -> Result<Vec<u8>, SessionError> {
    let encoded = match encoded.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or_default(),
        None => encoded,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| SessionError::Validation(format!("audio is not valid base64: {}", err)))
}
