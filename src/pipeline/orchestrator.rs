//! # Pipeline Orchestrator
//!
//! Runs recognize → translate → synthesize for one audio payload and pushes
//! each result to the session as soon as it is known.
//!
//! ## Degradation rules:
//! - Recognition that fails, returns nothing, or returns a marker meaning
//!   "nothing recognized" is replaced by the configured fallback text. An
//!   engine-side cancellation keeps whatever partial text it produced.
//! - A failed translation falls back to the recognized text.
//! - A failed synthesis produces an empty `AUDIO_RESULT`.
//! - Only a closed provider pool fails the pipeline outright.
//!
//! ## Budget:
//! The whole run is bounded by the processing budget. When it elapses the
//! in-flight stage is dropped, a `TIMEOUT` error is emitted and the borrowed
//! handles go back to their pool through the [`ResourceScope`].
//!
//! ## Rust Concepts:
//! - **tokio::select! with `biased`**: cancellation is checked before the
//!   pipeline future is polled
//! - **Dropping futures**: a timed-out or cancelled stage is simply dropped;
//!   RAII guards release everything it held

use super::policy::StagePolicy;
use super::scope::ResourceScope;
use super::silence::{wait_for_silence, RecognitionProgress, SilencePolicy};
use super::ResultEmitter;
use crate::config::PipelineConfig;
use crate::error::SessionError;
use crate::pool::PoolError;
use crate::protocol::{AudioFormat, Mode, TranslationConfig, WireMessage};
use crate::providers::handle::ProviderLease;
use crate::providers::{
    ProviderEntry, ProviderError, ProviderHandle, ProviderRegistry, RecognitionStyle, SpeechProvider,
};
use crate::state::RelayMetrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One unit of work: an audio payload and the config it is processed with.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest<'a> {
    pub session_id: &'a str,
    pub audio: &'a [u8],
    pub config: &'a TranslationConfig,
    pub is_file_upload: bool,
}

/// A stage that did not produce its normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    FallbackText,
    TranslationFallback,
    EmptyAudio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// Completed, but at least one stage fell back.
    Degraded(Vec<Degradation>),
    /// Refused before any provider call.
    Rejected(SessionError),
    TimedOut,
    /// The session went away or the run was cancelled.
    Cancelled,
    Failed(SessionError),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Completed | PipelineOutcome::Degraded(_))
    }

    /// The error that should end the session, if any.
    pub fn fatal_error(&self) -> Option<&SessionError> {
        match self {
            PipelineOutcome::Failed(err) if err.is_fatal() => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PipelineSettings {
    budget: Duration,
    silence: SilencePolicy,
    stage: StagePolicy,
    max_synthesis_chars: usize,
    fallback_text: String,
    unrecognized_markers: Vec<String>,
}

impl PipelineSettings {
    fn from_config(config: &PipelineConfig) -> Self {
        Self {
            budget: config.processing_budget(),
            silence: SilencePolicy::from_config(config),
            stage: StagePolicy::from_config(&config.stage),
            max_synthesis_chars: config.max_synthesis_chars,
            fallback_text: config.fallback_text.clone(),
            unrecognized_markers: config.unrecognized_markers.clone(),
        }
    }
}

enum StageCall<'a> {
    Recognize {
        audio: &'a [u8],
        language: &'a str,
        progress: &'a RecognitionProgress,
    },
    Translate {
        text: &'a str,
        source: &'a str,
        target: &'a str,
    },
    Synthesize {
        text: &'a str,
        language: &'a str,
        voice: Option<&'a str>,
        format: AudioFormat,
    },
}

impl StageCall<'_> {
    fn stage(&self) -> &'static str {
        match self {
            StageCall::Recognize { .. } => "recognize",
            StageCall::Translate { .. } => "translate",
            StageCall::Synthesize { .. } => "synthesize",
        }
    }
}

enum StageOutput {
    Text(String),
    Audio(Vec<u8>),
}

impl StageOutput {
    fn into_text(self) -> Result<String, ProviderError> {
        match self {
            StageOutput::Text(text) => Ok(text),
            StageOutput::Audio(_) => Err(ProviderError::Decode("expected text, got audio".into())),
        }
    }

    fn into_audio(self) -> Result<Vec<u8>, ProviderError> {
        match self {
            StageOutput::Audio(audio) => Ok(audio),
            StageOutput::Text(_) => Err(ProviderError::Decode("expected audio, got text".into())),
        }
    }
}

/// Why the stages stopped early.
enum Halt {
    ReceiverGone,
    Fatal(SessionError),
}

pub struct PipelineOrchestrator {
    providers: Arc<ProviderRegistry>,
    settings: PipelineSettings,
    metrics: Arc<RelayMetrics>,
}

impl PipelineOrchestrator {
    pub fn new(providers: Arc<ProviderRegistry>, config: &PipelineConfig, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            providers,
            settings: PipelineSettings::from_config(config),
            metrics,
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Process one payload. Never panics and never returns an error: every
    /// problem is reported through `emitter` and summarized in the outcome.
    pub async fn run(
        &self,
        request: PipelineRequest<'_>,
        emitter: &dyn ResultEmitter,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        RelayMetrics::incr(&self.metrics.pipelines_started);
        let started = Instant::now();

        let outcome = self.run_budgeted(request, emitter, cancel).await;

        self.metrics.record_outcome(&outcome);
        info!(
            session_id = %request.session_id,
            outcome = ?outcome,
            upload = request.is_file_upload,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );
        outcome
    }

    async fn run_budgeted(
        &self,
        request: PipelineRequest<'_>,
        emitter: &dyn ResultEmitter,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        if request.audio.is_empty() {
            let err = SessionError::EmptyAudio;
            emitter.emit(WireMessage::error(&err));
            return PipelineOutcome::Rejected(err);
        }

        let Some(entry) = self.providers.resolve(request.config.provider.as_deref()) else {
            let err = SessionError::Provider("no speech provider is registered".into());
            emitter.emit(WireMessage::error(&err));
            return PipelineOutcome::Rejected(err);
        };

        debug!(
            session_id = %request.session_id,
            provider = %entry.name(),
            bytes = request.audio.len(),
            mode = ?request.config.mode,
            "Pipeline started"
        );

        let budget = self.settings.budget;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => PipelineOutcome::Cancelled,
            result = tokio::time::timeout(budget, self.run_stages(&entry, request, emitter)) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(session_id = %request.session_id, budget_secs = budget.as_secs(), "Pipeline exceeded processing budget");
                    let err = SessionError::Timeout(format!(
                        "processing exceeded the {} s budget",
                        budget.as_secs()
                    ));
                    emitter.emit(WireMessage::error(&err));
                    PipelineOutcome::TimedOut
                }
            },
        }
    }

    async fn run_stages(
        &self,
        entry: &ProviderEntry,
        request: PipelineRequest<'_>,
        emitter: &dyn ResultEmitter,
    ) -> PipelineOutcome {
        let mut scope = ResourceScope::new(request.session_id);
        let mut degraded = Vec::new();

        match self.stages(entry, request, emitter, &mut scope, &mut degraded).await {
            Ok(()) if degraded.is_empty() => PipelineOutcome::Completed,
            Ok(()) => PipelineOutcome::Degraded(degraded),
            Err(Halt::ReceiverGone) => PipelineOutcome::Cancelled,
            Err(Halt::Fatal(err)) => {
                emitter.emit(WireMessage::error(&err));
                PipelineOutcome::Failed(err)
            }
        }
    }

    async fn stages(
        &self,
        entry: &ProviderEntry,
        request: PipelineRequest<'_>,
        emitter: &dyn ResultEmitter,
        scope: &mut ResourceScope<ProviderLease>,
        degraded: &mut Vec<Degradation>,
    ) -> Result<(), Halt> {
        let config = request.config;
        let upload = request.is_file_upload;
        let send = |message: WireMessage| {
            if emitter.emit(message) {
                Ok(())
            } else {
                Err(Halt::ReceiverGone)
            }
        };

        // recognize
        let progress = RecognitionProgress::new();
        let recognize = StageCall::Recognize {
            audio: request.audio,
            language: &config.source_language,
            progress: &progress,
        };
        let recognized = match self.call(entry, scope, &recognize).await.and_then(StageOutput::into_text) {
            Ok(text) => text,
            Err(ProviderError::Cancelled { partial }) => {
                debug!(session_id = %request.session_id, "Recognition cancelled by engine, keeping partial text");
                if partial.is_empty() {
                    progress.accumulated()
                } else {
                    partial
                }
            }
            Err(err) => {
                Self::check_fatal(&err)?;
                warn!(session_id = %request.session_id, error = %err, "Recognition failed, using fallback text");
                String::new()
            }
        };

        let text = if self.is_unrecognized(&recognized) {
            degraded.push(Degradation::FallbackText);
            self.settings.fallback_text.clone()
        } else {
            recognized.trim().to_string()
        };
        send(WireMessage::text_result(text.clone(), upload))?;

        if config.mode == Mode::SpeechToText {
            return send(WireMessage::completion(upload));
        }

        // translate
        let mut spoken = text;
        if config.needs_translation() {
            let translate = StageCall::Translate {
                text: &spoken,
                source: &config.source_language,
                target: &config.target_language,
            };
            match self.call(entry, scope, &translate).await.and_then(StageOutput::into_text) {
                Ok(translated) if !translated.trim().is_empty() => spoken = translated.trim().to_string(),
                Ok(_) => {
                    warn!(session_id = %request.session_id, "Translation came back empty, keeping original text");
                    degraded.push(Degradation::TranslationFallback);
                }
                Err(err) => {
                    Self::check_fatal(&err)?;
                    warn!(session_id = %request.session_id, error = %err, "Translation failed, keeping original text");
                    degraded.push(Degradation::TranslationFallback);
                }
            }
            send(WireMessage::translation(spoken.clone(), upload))?;
        }

        // synthesize
        let input = truncate_for_synthesis(&spoken, self.settings.max_synthesis_chars);
        let synthesize = StageCall::Synthesize {
            text: &input,
            language: &config.target_language,
            voice: config.voice.as_deref(),
            format: config.audio_format,
        };
        let audio = match self.call(entry, scope, &synthesize).await.and_then(StageOutput::into_audio) {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => {
                warn!(session_id = %request.session_id, "Synthesis returned no audio");
                degraded.push(Degradation::EmptyAudio);
                Vec::new()
            }
            Err(err) => {
                Self::check_fatal(&err)?;
                warn!(session_id = %request.session_id, error = %err, "Synthesis failed, sending empty audio");
                degraded.push(Degradation::EmptyAudio);
                Vec::new()
            }
        };
        send(WireMessage::audio_result(&audio, upload))?;
        send(WireMessage::completion(upload))
    }

    fn check_fatal(err: &ProviderError) -> Result<(), Halt> {
        match err {
            ProviderError::Pool(PoolError::Closed { pool }) => Err(Halt::Fatal(SessionError::PoolClosed(pool.clone()))),
            _ => Ok(()),
        }
    }

    fn is_unrecognized(&self, text: &str) -> bool {
        let text = text.trim();
        text.is_empty()
            || self
                .settings
                .unrecognized_markers
                .iter()
                .any(|marker| marker.trim().eq_ignore_ascii_case(text))
    }

    /// Run one stage, retrying transient failures per the stage policy.
    async fn call(
        &self,
        entry: &ProviderEntry,
        scope: &mut ResourceScope<ProviderLease>,
        call: &StageCall<'_>,
    ) -> Result<StageOutput, ProviderError> {
        let stage = call.stage();
        let policy = self.settings.stage;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            match self.attempt(entry, scope, call, policy.timeout).await {
                Ok(output) => {
                    debug!(
                        provider = %entry.name(),
                        stage,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Stage finished"
                    );
                    return Ok(output);
                }
                Err(err) => match policy.retry_after(&err, attempt) {
                    Some(delay) => {
                        warn!(
                            provider = %entry.name(),
                            stage,
                            attempt,
                            error = %err,
                            retry_in_ms = delay.as_millis() as u64,
                            "Stage failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    async fn attempt(
        &self,
        entry: &ProviderEntry,
        scope: &mut ResourceScope<ProviderLease>,
        call: &StageCall<'_>,
        timeout: Duration,
    ) -> Result<StageOutput, ProviderError> {
        let stage = call.stage();
        let mark = scope.mark();
        let lease = scope.hold(stage, entry.pool.borrow().await?);

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.invoke(entry.adapter.as_ref(), &mut **lease, call)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                stage,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };

        if let Err(err) = &result {
            if err.invalidates_handle() {
                warn!(provider = %entry.name(), stage, "Credentials rejected, discarding handle");
                lease.invalidate();
            }
        }
        scope.release_to(mark);
        result
    }

    async fn invoke(
        &self,
        adapter: &dyn SpeechProvider,
        handle: &mut ProviderHandle,
        call: &StageCall<'_>,
    ) -> Result<StageOutput, ProviderError> {
        match call {
            StageCall::Recognize {
                audio,
                language,
                progress,
            } => {
                let recognition = adapter.recognize(handle, audio, language, progress);
                match adapter.recognition_style() {
                    RecognitionStyle::SingleShot => recognition.await.map(StageOutput::Text),
                    RecognitionStyle::Continuous => tokio::select! {
                        result = recognition => result.map(StageOutput::Text),
                        verdict = wait_for_silence(progress, self.settings.silence) => {
                            debug!(?verdict, "Continuous recognition ended on silence");
                            Ok(StageOutput::Text(progress.accumulated()))
                        }
                    },
                }
            }
            StageCall::Translate { text, source, target } => adapter
                .translate(handle, text, source, target)
                .await
                .map(StageOutput::Text),
            StageCall::Synthesize {
                text,
                language,
                voice,
                format,
            } => adapter
                .synthesize(handle, text, language, *voice, *format)
                .await
                .map(StageOutput::Audio),
        }
    }
}

/// Cut text to `max_chars` characters, marking the cut with "...".
pub fn truncate_for_synthesis(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
