//! # Translation Pipeline
//!
//! One pipeline turns one audio payload into results:
//!
//! ```text
//! audio ─▶ recognize ─▶ TEXT_RESULT
//!                 └──▶ translate ─▶ TRANSLATION
//!                              └──▶ synthesize ─▶ AUDIO_RESULT ─▶ completion
//! ```
//!
//! Results are pushed to a [`ResultEmitter`] as soon as each stage finishes.
//! Stage failures degrade the result instead of failing the pipeline; see
//! [`orchestrator`] for the rules.

pub mod orchestrator;
pub mod policy;
pub mod scope;
pub mod silence;

use crate::protocol::WireMessage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub use orchestrator::{Degradation, PipelineOrchestrator, PipelineOutcome, PipelineRequest};

/// Where a pipeline sends its results.
pub trait ResultEmitter: Send + Sync {
    /// Deliver one message. `false` means nobody is listening any more and
    /// the pipeline should stop.
    fn emit(&self, message: WireMessage) -> bool;
}

/// Buffers results in memory. Used by the REST endpoints, which answer once
/// the pipeline is done.
#[derive(Debug)]
pub struct CollectingEmitter {
    messages: Mutex<Vec<WireMessage>>,
    open: AtomicBool,
}

impl Default for CollectingEmitter {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }
    }
}

impl CollectingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<WireMessage> {
        self.messages.lock().clone()
    }

    /// Refuse further results.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn recognized_text(&self) -> Option<String> {
        self.messages.lock().iter().find_map(|message| match message {
            WireMessage::TextResult {
                message,
                is_complete: false,
                ..
            } => Some(message.clone()),
            _ => None,
        })
    }

    pub fn translation(&self) -> Option<String> {
        self.messages.lock().iter().find_map(|message| match message {
            WireMessage::Translation { message, .. } => Some(message.clone()),
            _ => None,
        })
    }

    /// Base64 audio of the `AUDIO_RESULT`, if one was emitted.
    pub fn audio(&self) -> Option<String> {
        self.messages.lock().iter().find_map(|message| match message {
            WireMessage::AudioResult { audio, .. } => Some(audio.clone()),
            _ => None,
        })
    }
}

impl ResultEmitter for CollectingEmitter {
    fn emit(&self, message: WireMessage) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        self.messages.lock().push(message);
        true
    }
}
