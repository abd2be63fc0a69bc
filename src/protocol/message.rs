//! # Wire Messages
//!
//! Every text frame on the translation socket is one JSON object whose `type`
//! field picks the variant of [`WireMessage`]. Field names are camelCase and
//! unknown fields are ignored, so older and newer clients can share a server.
//!
//! ## Client → Server
//! - `INIT` with the session [`TranslationConfig`] (accepted under `config` or `request`)
//! - `PING` / `PONG` keepalives
//! - `CLOSE` to end the session
//! - `FILE_UPLOAD` with base64 audio and an optional per-upload config
//!
//! ## Server → Client
//! - `TEXT_RESULT`, `TRANSLATION`, `AUDIO_RESULT` as each pipeline stage finishes
//! - `TEXT_RESULT` with `isComplete: true` once a pipeline reaches its outcome
//! - `FILE_UPLOAD_PROGRESS` while an upload is processed
//! - `ERROR` with an [`ErrorCode`]
//!
//! Binary frames are raw audio and never pass through this module.

use crate::error::{ErrorCode, SessionError};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Text of the completion marker sent after each pipeline.
pub const COMPLETION_MESSAGE: &str = "processing complete";

/// One protocol message.
///
/// ## Rust Concepts:
/// - **#[serde(tag = "type")]**: internally tagged enum, the variant name is
///   stored next to the fields instead of wrapping them
/// - **rename_all_fields**: every struct variant uses camelCase field names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum WireMessage {
    Init {
        #[serde(default, alias = "request", skip_serializing_if = "Option::is_none")]
        config: Option<TranslationConfig>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    TextResult {
        message: String,
        #[serde(default)]
        is_complete: bool,
        #[serde(default)]
        is_file_upload: bool,
    },

    Translation {
        message: String,
        #[serde(default)]
        is_file_upload: bool,
    },

    /// Synthesized audio, base64 encoded. Empty when synthesis failed.
    AudioResult {
        audio: String,
        #[serde(default)]
        is_file_upload: bool,
    },

    FileUpload {
        #[serde(default, alias = "request", skip_serializing_if = "Option::is_none")]
        config: Option<TranslationConfig>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_type: Option<String>,
    },

    FileUploadProgress {
        progress: u8,
        status: String,
        #[serde(default)]
        is_complete: bool,
    },

    Error {
        message: String,
        error_code: ErrorCode,
    },
}

impl WireMessage {
    /// Wire name of the variant, also used as the `type` of chunk frames.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Init { .. } => "INIT",
            WireMessage::Ping { .. } => "PING",
            WireMessage::Pong { .. } => "PONG",
            WireMessage::Close { .. } => "CLOSE",
            WireMessage::TextResult { .. } => "TEXT_RESULT",
            WireMessage::Translation { .. } => "TRANSLATION",
            WireMessage::AudioResult { .. } => "AUDIO_RESULT",
            WireMessage::FileUpload { .. } => "FILE_UPLOAD",
            WireMessage::FileUploadProgress { .. } => "FILE_UPLOAD_PROGRESS",
            WireMessage::Error { .. } => "ERROR",
        }
    }

    pub fn ping_now() -> Self {
        WireMessage::Ping {
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn error(err: &SessionError) -> Self {
        WireMessage::Error {
            message: err.to_string(),
            error_code: err.code(),
        }
    }

    pub fn text_result(text: impl Into<String>, is_file_upload: bool) -> Self {
        WireMessage::TextResult {
            message: text.into(),
            is_complete: false,
            is_file_upload,
        }
    }

    pub fn completion(is_file_upload: bool) -> Self {
        WireMessage::TextResult {
            message: COMPLETION_MESSAGE.to_string(),
            is_complete: true,
            is_file_upload,
        }
    }

    pub fn translation(text: impl Into<String>, is_file_upload: bool) -> Self {
        WireMessage::Translation {
            message: text.into(),
            is_file_upload,
        }
    }

    pub fn audio_result(audio: &[u8], is_file_upload: bool) -> Self {
        WireMessage::AudioResult {
            audio: base64::engine::general_purpose::STANDARD.encode(audio),
            is_file_upload,
        }
    }

    pub fn progress(progress: u8, status: impl Into<String>, is_complete: bool) -> Self {
        WireMessage::FileUploadProgress {
            progress,
            status: status.into(),
            is_complete,
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, WireMessage::TextResult { is_complete: true, .. })
    }
}

/// Pipeline shape requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    SpeechToText,
    #[default]
    SpeechToSpeech,
}

/// Container format for synthesized audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AudioFormat {
    #[default]
    #[serde(alias = "wav")]
    Wav,
    #[serde(alias = "mp3")]
    Mp3,
    #[serde(alias = "ogg")]
    Ogg,
    #[serde(alias = "webm")]
    Webm,
}

impl AudioFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Webm => "audio/webm",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Webm => "webm",
        }
    }
}

/// Recognizer/synthesizer tuning passed through to providers that support it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomOptions {
    #[serde(default)]
    pub noise_reduction: bool,
    #[serde(default)]
    pub use_punctuation: bool,
    #[serde(default)]
    pub speaker_separation: bool,
    #[serde(default)]
    pub speed_factor: Option<f32>,
    #[serde(default)]
    pub pitch_factor: Option<f32>,
}

/// Session configuration sent with INIT. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationConfig {
    #[serde(default = "default_source_language")]
    pub source_language: String,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    /// Provider name; `None` selects the configured default.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub audio_format: AudioFormat,
    #[serde(default, alias = "voiceId")]
    pub voice: Option<String>,
    #[serde(default)]
    pub return_audio: bool,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(default)]
    pub custom_options: Option<CustomOptions>,
}

fn default_source_language() -> String {
    "auto".to_string()
}

fn default_target_language() -> String {
    "en-US".to_string()
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            source_language: default_source_language(),
            target_language: default_target_language(),
            provider: None,
            mode: Mode::default(),
            audio_format: AudioFormat::default(),
            voice: None,
            return_audio: false,
            sample_rate: None,
            speed: None,
            custom_options: None,
        }
    }
}

impl TranslationConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.source_language.trim().is_empty() {
            return Err(SessionError::Validation("sourceLanguage cannot be empty".into()));
        }
        if self.target_language.trim().is_empty() {
            return Err(SessionError::Validation("targetLanguage cannot be empty".into()));
        }
        if let Some(rate) = self.sample_rate {
            if !(8_000..=48_000).contains(&rate) {
                return Err(SessionError::Validation(format!(
                    "sampleRate {} is outside 8000..=48000",
                    rate
                )));
            }
        }
        if let Some(speed) = self.speed {
            if !(0.25..=4.0).contains(&speed) {
                return Err(SessionError::Validation(format!(
                    "speed {} is outside 0.25..=4.0",
                    speed
                )));
            }
        }
        Ok(())
    }

    /// Translation runs only between two different, explicitly named languages.
    pub fn needs_translation(&self) -> bool {
        !self.source_language.eq_ignore_ascii_case("auto")
            && !self
                .source_language
                .eq_ignore_ascii_case(&self.target_language)
    }
}
