//! OpenAI adapter: Whisper transcription, chat-completion translation and
//! the `audio/speech` TTS endpoint.

use super::{api_error, ProviderError, ProviderHandle, SpeechProvider};
use crate::config::OpenAiConfig;
use crate::pipeline::silence::RecognitionProgress;
use crate::protocol::AudioFormat;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const PROVIDER_NAME: &str = "openai";

pub struct OpenAiSpeechProvider {
    client: Client,
    config: OpenAiConfig,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenAiSpeechProvider {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, handle: &ProviderHandle, path: &str) -> String {
        format!("{}/{}", handle.credentials.endpoint.trim_end_matches('/'), path)
    }
}

/// Whisper takes ISO-639-1 codes and auto-detects when none is given.
pub fn whisper_language(tag: &str) -> Option<String> {
    if tag.eq_ignore_ascii_case("auto") || tag.trim().is_empty() {
        return None;
    }
    tag.split('-').next().map(str::to_lowercase)
}

/// `response_format` for `audio/speech`. WEBM has no direct equivalent, so
/// it gets Opus, the codec a WEBM client expects.
pub fn speech_response_format(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Wav => "wav",
        AudioFormat::Mp3 => "mp3",
        AudioFormat::Ogg | AudioFormat::Webm => "opus",
    }
}

fn translation_prompt(source_language: &str, target_language: &str) -> String {
    format!(
        "Translate the user's text from {} to {}. Reply with the translation only.",
        source_language, target_language
    )
}

#[async_trait]
impl SpeechProvider for OpenAiSpeechProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_available(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    async fn recognize(
        &self,
        handle: &mut ProviderHandle,
        audio: &[u8],
        language: &str,
        progress: &RecognitionProgress,
    ) -> Result<String, ProviderError> {
        handle.tune(Some(language), None, AudioFormat::Wav);

        let file = Part::bytes(audio.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(ProviderError::from_reqwest)?;
        let mut form = Form::new()
            .part("file", file)
            .text("model", self.config.transcription_model.clone());
        if let Some(code) = whisper_language(language) {
            form = form.text("language", code);
        }

        let response = self
            .client
            .post(self.url(handle, "audio/transcriptions"))
            .bearer_auth(&handle.credentials.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(api_error(PROVIDER_NAME, response).await);
        }

        let result: TranscriptionResponse = response.json().await.map_err(ProviderError::from_reqwest)?;
        let text = result.text.trim().to_string();
        progress.finalized(&text);
        debug!(handle_id = handle.id, chars = text.chars().count(), "Whisper transcription finished");
        Ok(text)
    }

    async fn translate(
        &self,
        handle: &mut ProviderHandle,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, ProviderError> {
        let format = handle.output_format;
        handle.tune(Some(target_language), None, format);

        let body = json!({
            "model": self.config.translation_model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": translation_prompt(source_language, target_language) },
                { "role": "user", "content": text }
            ]
        });

        let response = self
            .client
            .post(self.url(handle, "chat/completions"))
            .bearer_auth(&handle.credentials.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(api_error(PROVIDER_NAME, response).await);
        }

        let chat: ChatResponse = response.json().await.map_err(ProviderError::from_reqwest)?;
        chat.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| ProviderError::Decode("chat completion returned no choices".into()))
    }

    async fn synthesize(
        &self,
        handle: &mut ProviderHandle,
        text: &str,
        language: &str,
        voice: Option<&str>,
        format: AudioFormat,
    ) -> Result<Vec<u8>, ProviderError> {
        let voice = voice.unwrap_or(self.config.default_voice.as_str()).to_string();
        handle.tune(Some(language), Some(&voice), format);

        let body = json!({
            "model": self.config.tts_model,
            "input": text,
            "voice": voice,
            "speed": self.config.speed,
            "response_format": speech_response_format(format),
        });

        let response = self
            .client
            .post(self.url(handle, "audio/speech"))
            .bearer_auth(&handle.credentials.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(api_error(PROVIDER_NAME, response).await);
        }

        let audio = response.bytes().await.map_err(ProviderError::from_reqwest)?;
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_whisper_language() {
        assert_eq!(whisper_language("zh-CN"), Some("zh".to_string()));
        assert_eq!(whisper_language("EN"), Some("en".to_string()));
        assert_eq!(whisper_language("auto"), None);
        assert_eq!(whisper_language(""), None);
    }

    #[test]
    fn test_speech_response_format() {
        assert_eq!(speech_response_format(AudioFormat::Wav), "wav");
        assert_eq!(speech_response_format(AudioFormat::Mp3), "mp3");
        assert_eq!(speech_response_format(AudioFormat::Webm), "opus");
    }

    #[test]
    fn test_translation_prompt_names_both_languages() {
        let prompt = translation_prompt("zh-CN", "en-US");
        assert!(prompt.contains("zh-CN"));
        assert!(prompt.contains("en-US"));
    }

    #[test]
    fn test_availability_follows_api_key() {
        let mut config = AppConfig::default().providers.openai;
        assert!(!OpenAiSpeechProvider::new(config.clone()).unwrap().is_available());
        config.api_key = "sk-test".into();
        assert!(OpenAiSpeechProvider::new(config).unwrap().is_available());
    }
}
