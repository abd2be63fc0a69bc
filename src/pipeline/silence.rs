//! Silence-based completion for continuous recognizers.
//!
//! A continuous recognizer reports partial results while it listens and may
//! never say that it is done. The orchestrator races such a recognizer
//! against [`wait_for_silence`]: once the recognizer has been quiet for the
//! silence threshold after producing something, or for the much longer
//! absolute threshold without producing anything, the text accumulated so
//! far is taken as the result and the recognizer future is dropped.
//!
//! The watchdog is a plain future. It runs only while it is being polled, so
//! dropping it (the pipeline finished, timed out or was cancelled) also
//! stops the periodic check.

use crate::config::PipelineConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Activity clock and accumulated text for one recognition call.
#[derive(Debug)]
pub struct RecognitionProgress {
    state: Mutex<ProgressState>,
}

#[derive(Debug)]
struct ProgressState {
    last_activity: Instant,
    finalized: String,
    pending: String,
    events: u32,
}

impl Default for RecognitionProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl RecognitionProgress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                last_activity: Instant::now(),
                finalized: String::new(),
                pending: String::new(),
                events: 0,
            }),
        }
    }

    /// An interim hypothesis for the phrase currently being spoken.
    pub fn partial(&self, text: &str) {
        let mut state = self.state.lock();
        state.pending = text.to_string();
        state.last_activity = Instant::now();
        state.events += 1;
    }

    /// A phrase the recognizer will not revise any more.
    pub fn finalized(&self, text: &str) {
        let mut state = self.state.lock();
        if !text.is_empty() {
            if !state.finalized.is_empty() {
                state.finalized.push(' ');
            }
            state.finalized.push_str(text);
        }
        state.pending.clear();
        state.last_activity = Instant::now();
        state.events += 1;
    }

    /// Everything recognized so far, including the unfinished phrase.
    pub fn accumulated(&self) -> String {
        let state = self.state.lock();
        match (state.finalized.is_empty(), state.pending.is_empty()) {
            (_, true) => state.finalized.clone(),
            (true, false) => state.pending.clone(),
            (false, false) => format!("{} {}", state.finalized, state.pending),
        }
    }

    pub fn has_activity(&self) -> bool {
        self.state.lock().events > 0
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.state.lock().last_activity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilencePolicy {
    pub threshold: Duration,
    pub check_interval: Duration,
    pub absolute: Duration,
}

impl SilencePolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let threshold = config.silence_threshold();
        Self {
            threshold,
            check_interval: config.silence_check_interval(),
            absolute: threshold * config.absolute_silence_multiplier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceVerdict {
    /// Speech was heard and then stopped.
    SpeechEnded,
    /// Nothing was heard for the absolute threshold.
    NoSpeech,
}

/// Resolve once the recognizer has gone quiet.
pub async fn wait_for_silence(progress: &RecognitionProgress, policy: SilencePolicy) -> SilenceVerdict {
    let mut ticker = tokio::time::interval(policy.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let idle = progress.idle_for();
        if progress.has_activity() && idle >= policy.threshold {
            return SilenceVerdict::SpeechEnded;
        }
        if idle >= policy.absolute {
            return if progress.has_activity() {
                SilenceVerdict::SpeechEnded
            } else {
                SilenceVerdict::NoSpeech
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SilencePolicy {
        SilencePolicy {
            threshold: Duration::from_secs(3),
            check_interval: Duration::from_millis(500),
            absolute: Duration::from_secs(9),
        }
    }

    #[test]
    fn test_accumulated_text_joins_final_and_pending() {
        let progress = RecognitionProgress::new();
        assert_eq!(progress.accumulated(), "");

        progress.partial("hel");
        assert_eq!(progress.accumulated(), "hel");

        progress.finalized("hello");
        progress.partial("wor");
        assert_eq!(progress.accumulated(), "hello wor");

        progress.finalized("world");
        assert_eq!(progress.accumulated(), "hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_then_silence_completes_after_threshold() {
        let progress = RecognitionProgress::new();
        progress.partial("hello");
        let started = Instant::now();

        let verdict = wait_for_silence(&progress, policy()).await;

        assert_eq!(verdict, SilenceVerdict::SpeechEnded);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_speech_completes_after_absolute_threshold() {
        let progress = RecognitionProgress::new();
        let started = Instant::now();

        let verdict = wait_for_silence(&progress, policy()).await;

        assert_eq!(verdict, SilenceVerdict::NoSpeech);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(9));
        assert!(waited < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ongoing_partials_keep_recognition_open() {
        let progress = std::sync::Arc::new(RecognitionProgress::new());
        let speaker = {
            let progress = progress.clone();
            tokio::spawn(async move {
                for word in ["one", "two", "three", "four", "five"] {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    progress.partial(word);
                }
            })
        };
        let started = Instant::now();

        let verdict = wait_for_silence(&progress, policy()).await;
        speaker.await.unwrap();

        assert_eq!(verdict, SilenceVerdict::SpeechEnded);
        // last partial at 10s, silence declared 3s later
        assert!(started.elapsed() >= Duration::from_secs(13));
        assert_eq!(progress.accumulated(), "five");
    }
}
