//! # Session Registry
//!
//! Process-wide map of live sessions. The connection handlers, the
//! heartbeat sweep and the idle reaper all go through it; nothing else holds
//! session state.
//!
//! ## Lifecycle:
//! ```text
//! CONNECTING ─INIT─▶ INITIALIZED ─audio/text─▶ ACTIVE ◀─PONG─ AWAITING_HEARTBEAT
//!                                                  └──PING──────────▲
//! any ─CLOSE / transport error / idle timeout─▶ CLOSING ─▶ CLOSED
//! ```
//!
//! ## Rust Concepts:
//! - **RwLock<HashMap<_, Arc<_>>>**: lookups take a read lock and clone the
//!   `Arc`, so per-session work never holds the map lock
//! - **AtomicBool::compare_exchange**: claims the single pipeline slot of a
//!   session without a lock

use super::transport::{CloseCode, Outbox};
use crate::config::CodecConfig;
use crate::error::SessionError;
use crate::protocol::{ChunkAssembler, TranslationConfig};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Initialized,
    Active,
    AwaitingHeartbeat,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether the session has a config and is still serving.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Initialized | SessionState::Active | SessionState::AwaitingHeartbeat
        )
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    config: Option<Arc<TranslationConfig>>,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
}

/// Server-side state of one connection.
pub struct SessionRecord {
    pub id: String,
    inner: Mutex<SessionInner>,
    pipeline_in_flight: AtomicBool,
    cancel: CancellationToken,
    outbox: Outbox,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                config: None,
                last_activity: Instant::now(),
                ping_sent_at: None,
            }),
            pipeline_in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            outbox,
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn config(&self) -> Option<Arc<TranslationConfig>> {
        self.inner.lock().config.clone()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Cancelled when the session starts closing. Pipelines run under a
    /// child of this token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.inner.lock().last_activity)
    }

    /// Accept the session config. The config is immutable once set.
    pub fn initialize(&self, config: TranslationConfig) -> Result<Arc<TranslationConfig>, SessionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closing | SessionState::Closed => {
                return Err(SessionError::Transport("session is closing".into()))
            }
            _ if inner.config.is_some() => return Err(SessionError::AlreadyInitialized),
            _ => {}
        }
        let config = Arc::new(config);
        inner.config = Some(Arc::clone(&config));
        inner.state = SessionState::Initialized;
        inner.last_activity = Instant::now();
        Ok(config)
    }

    /// Client traffic on an initialized session.
    pub fn mark_active(&self) {
        let mut inner = self.inner.lock();
        inner.last_activity = Instant::now();
        if matches!(inner.state, SessionState::Initialized | SessionState::AwaitingHeartbeat) {
            inner.state = SessionState::Active;
            inner.ping_sent_at = None;
        }
    }

    /// Record a heartbeat ping. The first unanswered ping starts the pong clock.
    pub fn ping_sent(&self) {
        let mut inner = self.inner.lock();
        if inner.ping_sent_at.is_none() {
            inner.ping_sent_at = Some(Instant::now());
        }
        if inner.state == SessionState::Active {
            inner.state = SessionState::AwaitingHeartbeat;
        }
    }

    /// A heartbeat answer. Proves the transport is alive but is not client
    /// activity, so the idle clock keeps running.
    pub fn pong_received(&self) {
        let mut inner = self.inner.lock();
        inner.ping_sent_at = None;
        if matches!(inner.state, SessionState::AwaitingHeartbeat | SessionState::Initialized) {
            inner.state = SessionState::Active;
        }
    }

    /// Whether a ping has gone unanswered for longer than `timeout`.
    pub fn heartbeat_overdue(&self, timeout: Duration) -> bool {
        self.inner
            .lock()
            .ping_sent_at
            .is_some_and(|sent| Instant::now().duration_since(sent) > timeout)
    }

    /// Move to CLOSING and cancel the running pipeline. Returns `false` if
    /// someone else already started closing this session.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        inner.state = SessionState::Closing;
        drop(inner);
        self.cancel.cancel();
        true
    }

    fn mark_closed(&self) {
        self.inner.lock().state = SessionState::Closed;
    }

    /// Claim the single pipeline slot.
    pub fn try_start_pipeline(&self) -> Result<(), SessionError> {
        self.pipeline_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| SessionError::Busy)
    }

    pub fn finish_pipeline(&self) {
        self.pipeline_in_flight.store(false, Ordering::Release);
    }

    pub fn pipeline_in_flight(&self) -> bool {
        self.pipeline_in_flight.load(Ordering::Acquire)
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionRecord>>>,
    chunks: ChunkAssembler,
}

impl SessionRegistry {
    pub fn new(codec: &CodecConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            chunks: ChunkAssembler::new(codec.max_reassembly_bytes, codec.reassembly_timeout()),
        }
    }

    pub fn add(&self, record: Arc<SessionRecord>) {
        debug!(session_id = %record.id, "Session registered");
        self.sessions.write().insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.chunks.discard(id);
        self.sessions.write().remove(id)
    }

    /// Refresh a session's activity clock. `false` if it is not registered.
    pub fn touch(&self, id: &str) -> bool {
        match self.get(id) {
            Some(record) => {
                record.touch();
                true
            }
            None => false,
        }
    }

    /// Every registered session, for a sweep to iterate without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts_by_state(&self) -> BTreeMap<SessionState, usize> {
        let mut counts = BTreeMap::new();
        for record in self.snapshot() {
            *counts.entry(record.state()).or_insert(0) += 1;
        }
        counts
    }

    pub fn chunks(&self) -> &ChunkAssembler {
        &self.chunks
    }

    /// CLOSING → CLOSED: cancel the pipeline, send the close frame (when
    /// given), drop buffered chunks and unregister. Returns `false` when the
    /// session was already closing.
    pub fn close_session(&self, id: &str, close: Option<(CloseCode, &str)>) -> bool {
        let Some(record) = self.get(id) else {
            return false;
        };
        if !record.begin_close() {
            return false;
        }

        match close {
            Some((code, reason)) => record.outbox().close(code, reason),
            None => record.outbox().detach(),
        }
        self.remove(id);
        record.mark_closed();
        info!(
            session_id = %id,
            reason = close.map(|(_, reason)| reason).unwrap_or("transport closed"),
            "Session closed"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::protocol::MessageCodec;
    use crate::providers::testing::RecordingSink;
    use crate::session::transport::OutboundFrame;
    use crate::state::RelayMetrics;

    fn record(id: &str) -> (Arc<SessionRecord>, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let outbox = Outbox::new(
            sink.clone(),
            Arc::new(MessageCodec::with_limits(1024, 512)),
            Arc::new(RelayMetrics::default()),
        );
        (Arc::new(SessionRecord::new(id, outbox)), sink)
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(&AppConfig::default().codec)
    }

    #[test]
    fn test_second_init_is_rejected() {
        let (session, _) = record("a");
        assert_eq!(session.state(), SessionState::Connecting);

        session.initialize(TranslationConfig::default()).unwrap();
        assert_eq!(session.state(), SessionState::Initialized);

        let err = session.initialize(TranslationConfig::default()).unwrap_err();
        assert_eq!(err, SessionError::AlreadyInitialized);
    }

    #[test]
    fn test_pipeline_slot_is_exclusive() {
        let (session, _) = record("a");
        session.try_start_pipeline().unwrap();
        assert_eq!(session.try_start_pipeline(), Err(SessionError::Busy));

        session.finish_pipeline();
        assert!(session.try_start_pipeline().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_state_transitions() {
        let (session, _) = record("a");
        session.initialize(TranslationConfig::default()).unwrap();
        session.mark_active();
        assert_eq!(session.state(), SessionState::Active);

        session.ping_sent();
        assert_eq!(session.state(), SessionState::AwaitingHeartbeat);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!session.heartbeat_overdue(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(session.heartbeat_overdue(Duration::from_secs(10)));

        session.pong_received();
        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.heartbeat_overdue(Duration::from_secs(10)));
        assert_eq!(session.idle_for(), Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle_clock() {
        let registry = registry();
        let (session, _) = record("a");
        registry.add(session.clone());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(session.idle_for() >= Duration::from_secs(30));

        assert!(registry.touch("a"));
        assert_eq!(session.idle_for(), Duration::ZERO);
        assert!(!registry.touch("missing"));
    }

    #[test]
    fn test_close_session_cancels_closes_and_unregisters_once() {
        let registry = registry();
        let (session, sink) = record("a");
        registry.add(session.clone());
        let pipeline_token = session.cancel_token().child_token();

        assert!(registry.close_session("a", Some((CloseCode::Normal, "client closed"))));
        assert!(!registry.close_session("a", Some((CloseCode::Error, "again"))));

        assert!(pipeline_token.is_cancelled());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.get("a").is_none());
        assert_eq!(
            sink.close_frame(),
            Some(OutboundFrame::Close { code: CloseCode::Normal, reason: "client closed".into() })
        );
    }

    #[test]
    fn test_counts_by_state() {
        let registry = registry();
        let (a, _) = record("a");
        let (b, _) = record("b");
        let (c, _) = record("c");
        b.initialize(TranslationConfig::default()).unwrap();
        c.initialize(TranslationConfig::default()).unwrap();
        registry.add(a);
        registry.add(b);
        registry.add(c);

        let counts = registry.counts_by_state();
        assert_eq!(counts.get(&SessionState::Connecting), Some(&1));
        assert_eq!(counts.get(&SessionState::Initialized), Some(&2));
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_add_and_remove() {
        let registry = Arc::new(registry());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (session, _) = record(&format!("s{}", i));
                registry.add(session);
                if i % 2 == 0 {
                    registry.remove(&format!("s{}", i));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.len(), 16);
    }
}
