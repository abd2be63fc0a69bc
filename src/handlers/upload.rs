//! REST wrappers around the translation pipeline.
//!
//! Both endpoints take a multipart form, run one pipeline with a
//! [`CollectingEmitter`] and answer once it is done. They share the
//! orchestrator, the provider pools and the processing budget with the
//! WebSocket sessions.

use crate::error::{AppError, SessionError};
use crate::pipeline::{CollectingEmitter, Degradation, PipelineOutcome, PipelineRequest};
use crate::protocol::{Mode, TranslationConfig};
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

/// Largest audio file accepted by the REST endpoints.
const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Default)]
struct UploadForm {
    audio: Option<Vec<u8>>,
    filename: Option<String>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

async fn read_field(field: &mut Field, limit: usize) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
        if bytes.len() > limit {
            return Err(AppError::ValidationError(format!(
                "File too large: more than {} bytes",
                limit
            )));
        }
    }
    Ok(bytes)
}

/// Collect the audio file (`file` or `audio`) and every text field.
async fn read_form(mut payload: Multipart) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();

        if field_name == "file" || field_name == "audio" {
            form.filename = content_disposition.get_filename().map(|s| s.to_string());
            form.audio = Some(read_field(&mut field, MAX_FILE_SIZE).await?);
        } else {
            let value = read_field(&mut field, 64 * 1024).await?;
            let value = String::from_utf8(value).map_err(|_| {
                AppError::ValidationError(format!("Field '{}' is not valid UTF-8", field_name))
            })?;
            form.fields.insert(field_name, value);
        }
    }

    Ok(form)
}

fn parse_mode(raw: &str) -> Result<Mode, AppError> {
    serde_json::from_value(json!(raw))
        .map_err(|_| AppError::ValidationError(format!("Unknown mode '{}'", raw)))
}

struct PipelineResult {
    emitter: CollectingEmitter,
    degraded: Vec<Degradation>,
    provider: String,
}

async fn run_upload(
    state: &AppState,
    audio: &[u8],
    config: &TranslationConfig,
) -> Result<PipelineResult, AppError> {
    config.validate()?;

    let provider = state
        .providers
        .resolve(config.provider.as_deref())
        .map(|entry| entry.name().to_string())
        .ok_or_else(|| AppError::Unavailable("no speech provider is registered".to_string()))?;

    let session_id = format!("rest-{}", uuid::Uuid::new_v4());
    let emitter = CollectingEmitter::new();
    let cancel = state.shutdown.child_token();
    let request = PipelineRequest {
        session_id: &session_id,
        audio,
        config,
        is_file_upload: true,
    };

    let outcome = state.orchestrator.run(request, &emitter, &cancel).await;

    let degraded = match outcome {
        PipelineOutcome::Completed => Vec::new(),
        PipelineOutcome::Degraded(reasons) => reasons,
        PipelineOutcome::Rejected(err) => return Err(err.into()),
        PipelineOutcome::TimedOut => {
            return Err(AppError::Timeout("processing budget exceeded".to_string()))
        }
        PipelineOutcome::Cancelled => {
            return Err(AppError::Unavailable("server is shutting down".to_string()))
        }
        PipelineOutcome::Failed(err) => {
            warn!(session_id = %session_id, error = %err, "Upload pipeline failed");
            return Err(AppError::Unavailable(err.to_string()));
        }
    };

    Ok(PipelineResult {
        emitter,
        degraded,
        provider,
    })
}

fn require_audio(form: &mut UploadForm) -> Result<Vec<u8>, AppError> {
    match form.audio.take() {
        Some(audio) if !audio.is_empty() => Ok(audio),
        Some(_) => Err(SessionError::EmptyAudio.into()),
        None => Err(AppError::ValidationError("No audio file provided".to_string())),
    }
}

/// Recognize an uploaded audio file.
///
/// ## Endpoint: `POST /api/speech-to-text`
///
/// ## Form fields:
/// - `file`: the audio
/// - `sourceLanguage`: optional, defaults to `auto`
/// - `provider`: optional, defaults to the configured provider
///
/// ## Response:
/// ```json
/// { "success": true, "text": "hello world", "provider": "microsoft", "sourceLanguage": "auto" }
/// ```
pub async fn speech_to_text(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut form = read_form(payload).await?;
    let audio = require_audio(&mut form)?;

    let mut config = TranslationConfig {
        mode: Mode::SpeechToText,
        provider: form.field("provider").map(str::to_string),
        ..TranslationConfig::default()
    };
    if let Some(source) = form.field("sourceLanguage") {
        config.source_language = source.to_string();
    }
    // recognition only
    config.target_language = config.source_language.clone();

    info!(
        filename = ?form.filename,
        bytes = audio.len(),
        source_language = %config.source_language,
        "Speech-to-text upload"
    );

    let result = run_upload(&state, &audio, &config).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "text": result.emitter.recognized_text().unwrap_or_default(),
        "provider": result.provider,
        "sourceLanguage": config.source_language
    })))
}

/// Recognize, translate and (in speech-to-speech mode) synthesize an uploaded file.
///
/// ## Endpoint: `POST /api/translation/file`
///
/// ## Form fields:
/// `file`, `sourceLanguage`, `targetLanguage`, `provider`, `voice`, `mode`
///
/// ## Response:
/// ```json
/// {
///   "success": true,
///   "text": "hallo welt",
///   "translation": "hello world",
///   "audio": "UklGR...",
///   "degraded": [],
///   "provider": "microsoft"
/// }
/// ```
pub async fn translation_file(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut form = read_form(payload).await?;
    let audio = require_audio(&mut form)?;

    let mut config = TranslationConfig {
        provider: form.field("provider").map(str::to_string),
        voice: form.field("voice").map(str::to_string),
        ..TranslationConfig::default()
    };
    if let Some(source) = form.field("sourceLanguage") {
        config.source_language = source.to_string();
    }
    if let Some(target) = form.field("targetLanguage") {
        config.target_language = target.to_string();
    }
    if let Some(mode) = form.field("mode") {
        config.mode = parse_mode(mode)?;
    }

    info!(
        filename = ?form.filename,
        bytes = audio.len(),
        source_language = %config.source_language,
        target_language = %config.target_language,
        mode = ?config.mode,
        "Translation upload"
    );

    let result = run_upload(&state, &audio, &config).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "text": result.emitter.recognized_text().unwrap_or_default(),
        "translation": result.emitter.translation(),
        "audio": result.emitter.audio(),
        "degraded": result.degraded,
        "provider": result.provider
    })))
}
