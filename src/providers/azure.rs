//! Azure Speech + Translator adapter (registered as `microsoft`).
//!
//! - Recognition: speech-to-text REST API for short audio
//! - Translation: Translator v3 `/translate`
//! - Synthesis: neural TTS through SSML, output format picked from `audioFormat`

use super::{api_error, ProviderError, ProviderHandle, SpeechProvider};
use crate::config::MicrosoftConfig;
use crate::pipeline::silence::RecognitionProgress;
use crate::protocol::AudioFormat;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const PROVIDER_NAME: &str = "microsoft";

/// The short-audio REST API has no auto-detect, so `auto` is sent as this.
const AUTO_RECOGNITION_LANGUAGE: &str = "en-US";

pub struct AzureSpeechProvider {
    client: Client,
    config: MicrosoftConfig,
}

#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    #[serde(rename = "RecognitionStatus")]
    status: String,
    #[serde(rename = "DisplayText", default)]
    display_text: String,
}

#[derive(Debug, Deserialize)]
struct TranslateItem {
    translations: Vec<TranslatedText>,
}

#[derive(Debug, Deserialize)]
struct TranslatedText {
    text: String,
}

impl AzureSpeechProvider {
    pub fn new(config: MicrosoftConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { client, config })
    }

    fn default_voice_for(&self, language: &str) -> String {
        let prefix = language.to_lowercase();
        if self.config.default_voice.to_lowercase().starts_with(&prefix) {
            return self.config.default_voice.clone();
        }
        let voice = match prefix.as_str() {
            "zh-cn" => "zh-CN-XiaoxiaoNeural",
            "zh-tw" => "zh-TW-HsiaoChenNeural",
            "ja-jp" => "ja-JP-NanamiNeural",
            "ko-kr" => "ko-KR-SunHiNeural",
            "de-de" => "de-DE-KatjaNeural",
            "fr-fr" => "fr-FR-DeniseNeural",
            "es-es" => "es-ES-ElviraNeural",
            "en-gb" => "en-GB-SoniaNeural",
            "en-us" => "en-US-JennyNeural",
            _ => return self.config.default_voice.clone(),
        };
        voice.to_string()
    }
}

/// Map a BCP-47 tag to the code Translator expects.
pub fn translator_language(tag: &str) -> String {
    let lower = tag.to_lowercase();
    match lower.as_str() {
        "zh-cn" | "zh-sg" | "zh-hans" | "zh" => "zh-Hans".to_string(),
        "zh-tw" | "zh-hk" | "zh-hant" => "zh-Hant".to_string(),
        _ => lower.split('-').next().unwrap_or(&lower).to_string(),
    }
}

/// Value of the `X-Microsoft-OutputFormat` header.
pub fn output_format_header(format: AudioFormat) -> &'static str {
    match format {
        AudioFormat::Mp3 => "audio-16khz-32kbitrate-mono-mp3",
        AudioFormat::Ogg => "ogg-16khz-16bit-mono-opus",
        AudioFormat::Webm => "webm-16khz-16bit-mono-opus",
        AudioFormat::Wav => "riff-16khz-16bit-mono-pcm",
    }
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn build_ssml(text: &str, language: &str, voice: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='{}'><voice name='{}'>{}</voice></speak>",
        escape_xml(language),
        escape_xml(voice),
        escape_xml(text)
    )
}

/// Interpret a short-audio recognition response.
fn parse_recognition(body: &str) -> Result<String, ProviderError> {
    let response: RecognitionResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    match response.status.as_str() {
        "Success" => Ok(response.display_text),
        "NoMatch" | "InitialSilenceTimeout" | "BabbleTimeout" => Ok(String::new()),
        "EndOfDictation" => Err(ProviderError::Cancelled {
            partial: response.display_text,
        }),
        other => Err(ProviderError::Decode(format!("recognition status {}", other))),
    }
}

#[async_trait]
impl SpeechProvider for AzureSpeechProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_available(&self) -> bool {
        !self.config.subscription_key.is_empty()
    }

    async fn recognize(
        &self,
        handle: &mut ProviderHandle,
        audio: &[u8],
        language: &str,
        progress: &RecognitionProgress,
    ) -> Result<String, ProviderError> {
        let language = if language.eq_ignore_ascii_case("auto") {
            AUTO_RECOGNITION_LANGUAGE
        } else {
            language
        };
        handle.tune(Some(language), None, AudioFormat::Wav);

        let url = format!(
            "https://{}.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1",
            handle.credentials.region
        );
        let response = self
            .client
            .post(&url)
            .query(&[("language", language), ("format", "simple")])
            .header("Ocp-Apim-Subscription-Key", &handle.credentials.api_key)
            .header("Content-Type", "audio/wav; codecs=audio/pcm; samplerate=16000")
            .header("Accept", "application/json")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(api_error(PROVIDER_NAME, response).await);
        }

        let body = response.text().await.map_err(ProviderError::from_reqwest)?;
        let text = parse_recognition(&body)?;
        progress.finalized(&text);
        debug!(handle_id = handle.id, chars = text.chars().count(), "Azure recognition finished");
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

        let (key, region) = if self.config.translator_key.is_empty() {
            (handle.credentials.api_key.as_str(), handle.credentials.region.as_str())
        } else {
            (self.config.translator_key.as_str(), self.config.translator_region.as_str())
        };

        let from = translator_language(source_language);
        let to = translator_language(target_language);
        let url = format!("{}/translate", handle.credentials.endpoint.trim_end_matches('/'));

        let mut request = self
            .client
            .post(&url)
            .query(&[("api-version", "3.0"), ("from", from.as_str()), ("to", to.as_str())])
            .header("Ocp-Apim-Subscription-Key", key)
            .json(&json!([{ "Text": text }]));
        if !region.is_empty() {
            request = request.header("Ocp-Apim-Subscription-Region", region);
        }

        let response = request.send().await.map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(api_error(PROVIDER_NAME, response).await);
        }

        let items: Vec<TranslateItem> = response.json().await.map_err(ProviderError::from_reqwest)?;
        items
            .into_iter()
            .next()
            .and_then(|item| item.translations.into_iter().next())
            .map(|t| t.text)
            .ok_or_else(|| ProviderError::Decode("translator returned no translations".into()))
    }

    async fn synthesize(
        &self,
        handle: &mut ProviderHandle,
        text: &str,
        language: &str,
        voice: Option<&str>,
        format: AudioFormat,
    ) -> Result<Vec<u8>, ProviderError> {
        let voice = voice
            .map(str::to_string)
            .unwrap_or_else(|| self.default_voice_for(language));
        handle.tune(Some(language), Some(&voice), format);

        let url = format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
            handle.credentials.region
        );
        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &handle.credentials.api_key)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", output_format_header(format))
            .header("User-Agent", concat!("speech-relay/", env!("CARGO_PKG_VERSION")))
            .body(build_ssml(text, language, &voice))
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
