//! Scripted provider and recording transport for tests.

use super::handle::{Credentials, ProviderHandleFactory};
use super::{ProviderEntry, ProviderError, ProviderHandle, RecognitionStyle, SpeechProvider};
use crate::config::PoolConfig;
use crate::pipeline::silence::RecognitionProgress;
use crate::pool::HandlePool;
use crate::protocol::{AudioFormat, Inbound, MessageCodec, WireMessage};
use crate::session::{FrameSink, OutboundFrame, TransportClosed};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// What `recognize` does.
#[derive(Debug, Clone)]
pub enum Recognition {
    Text(String),
    Fail(ProviderError),
    /// Engine-side cancellation carrying partial text.
    Cancel(String),
    /// Never returns.
    Stall,
    /// Report each partial after its delay, then never return.
    Stream(Vec<(Duration, String)>),
}

pub struct ScriptedProvider {
    name: String,
    available: bool,
    recognition: Recognition,
    recognize_delay: Option<Duration>,
    transient_failures: AtomicUsize,
    translation_error: Option<ProviderError>,
    synthesis_error: Option<ProviderError>,
    gate: Option<Arc<Semaphore>>,
    pub recognize_calls: AtomicUsize,
    pub translate_calls: AtomicUsize,
    pub synthesize_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a ScriptedProvider);

impl<'a> InFlight<'a> {
    fn enter(provider: &'a ScriptedProvider) -> Self {
        let now = provider.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        provider.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(provider)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn test_pool_config() -> PoolConfig {
    PoolConfig {
        max_total: 4,
        max_idle: 4,
        min_idle: 0,
        max_wait_ms: 1000,
        block_when_exhausted: true,
    }
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            available: true,
            recognition: Recognition::Text("hello world".into()),
            recognize_delay: None,
            transient_failures: AtomicUsize::new(0),
            translation_error: None,
            synthesis_error: None,
            gate: None,
            recognize_calls: AtomicUsize::new(0),
            translate_calls: AtomicUsize::new(0),
            synthesize_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn recognizing(mut self, text: &str) -> Self {
        self.recognition = Recognition::Text(text.to_string());
        self
    }

    pub fn recognition_fails(mut self, err: ProviderError) -> Self {
        self.recognition = Recognition::Fail(err);
        self
    }

    pub fn recognition_cancelled(mut self, partial: &str) -> Self {
        self.recognition = Recognition::Cancel(partial.to_string());
        self
    }

    pub fn recognition_stalls(mut self) -> Self {
        self.recognition = Recognition::Stall;
        self
    }

    pub fn streaming(mut self, partials: &[(u64, &str)]) -> Self {
        self.recognition = Recognition::Stream(
            partials
                .iter()
                .map(|(ms, text)| (Duration::from_millis(*ms), text.to_string()))
                .collect(),
        );
        self
    }

    pub fn recognize_delay(mut self, delay: Duration) -> Self {
        self.recognize_delay = Some(delay);
        self
    }

    /// Fail the first `count` recognitions with a network error.
    pub fn transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn translation_fails(mut self, err: ProviderError) -> Self {
        self.translation_error = Some(err);
        self
    }

    pub fn synthesis_fails(mut self, err: ProviderError) -> Self {
        self.synthesis_error = Some(err);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Hold every recognition until [`ScriptedProvider::release`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> (usize, usize, usize) {
        (
            self.recognize_calls.load(Ordering::SeqCst),
            self.translate_calls.load(Ordering::SeqCst),
            self.synthesize_calls.load(Ordering::SeqCst),
        )
    }

    pub fn into_entry(self) -> ProviderEntry {
        Arc::new(self).entry()
    }

    pub fn entry(self: &Arc<Self>) -> ProviderEntry {
        self.entry_with_pool(test_pool_config())
    }

    pub fn entry_with_pool(self: &Arc<Self>, config: PoolConfig) -> ProviderEntry {
        let credentials = Credentials {
            api_key: "test-key".into(),
            region: "local".into(),
            endpoint: String::new(),
        };
        let factory = ProviderHandleFactory::new(self.name.clone(), credentials, 10_000);
        ProviderEntry {
            adapter: Arc::clone(self) as Arc<dyn SpeechProvider>,
            pool: HandlePool::new(self.name.clone(), factory, config),
        }
    }
}

#[async_trait]
impl SpeechProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn recognition_style(&self) -> RecognitionStyle {
        match self.recognition {
            Recognition::Stream(_) => RecognitionStyle::Continuous,
            _ => RecognitionStyle::SingleShot,
        }
    }

    async fn recognize(
        &self,
        handle: &mut ProviderHandle,
        _audio: &[u8],
        language: &str,
        progress: &RecognitionProgress,
    ) -> Result<String, ProviderError> {
        self.recognize_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(self);
        handle.tune(Some(language), None, AudioFormat::Wav);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.recognize_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Network("connection reset".into()));
        }

        match &self.recognition {
            Recognition::Text(text) => {
                progress.finalized(text);
                Ok(text.clone())
            }
            Recognition::Fail(err) => Err(err.clone()),
            Recognition::Cancel(partial) => Err(ProviderError::Cancelled {
                partial: partial.clone(),
            }),
            Recognition::Stall => std::future::pending().await,
            Recognition::Stream(partials) => {
                for (delay, text) in partials {
                    tokio::time::sleep(*delay).await;
                    progress.partial(text);
                }
                std::future::pending().await
            }
        }
    }

    async fn translate(
        &self,
        handle: &mut ProviderHandle,
        text: &str,
        _source_language: &str,
        target_language: &str,
    ) -> Result<String, ProviderError> {
        self.translate_calls.fetch_add(1, Ordering::SeqCst);
        let format = handle.output_format;
        handle.tune(Some(target_language), None, format);
        match &self.translation_error {
            Some(err) => Err(err.clone()),
            None => Ok(format!("[{}] {}", target_language, text)),
        }
    }

    async fn synthesize(
        &self,
        handle: &mut ProviderHandle,
        text: &str,
        language: &str,
        voice: Option<&str>,
        format: AudioFormat,
    ) -> Result<Vec<u8>, ProviderError> {
        self.synthesize_calls.fetch_add(1, Ordering::SeqCst);
        handle.tune(Some(language), voice, format);
        match &self.synthesis_error {
            Some(err) => Err(err.clone()),
            None => Ok(format!("AUDIO:{}", text).into_bytes()),
        }
    }
}

/// A transport that keeps every frame it is asked to send.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<OutboundFrame>>,
    closed: AtomicBool,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.frames.lock().clone()
    }

    /// Text frames decoded back into messages. Chunk frames are skipped.
    pub fn messages(&self) -> Vec<WireMessage> {
        let codec = MessageCodec::with_limits(usize::MAX, 1024);
        self.frames
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Text(text) => match codec.decode(text) {
                    Ok(Inbound::Message(message)) => Some(message),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|frame| matches!(frame, OutboundFrame::Ping(_)))
            .count()
    }

    pub fn close_frame(&self) -> Option<OutboundFrame> {
        self.frames
            .lock()
            .iter()
            .find(|frame| matches!(frame, OutboundFrame::Close { .. }))
            .cloned()
    }

    /// Make every later send fail as if the peer vanished.
    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl FrameSink for RecordingSink {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportClosed> {
        if self.failing.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TransportClosed);
        }
        if matches!(frame, OutboundFrame::Close { .. }) {
            self.closed.store(true, Ordering::SeqCst);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.failing.load(Ordering::SeqCst)
    }
}
