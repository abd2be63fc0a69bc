//! # Error Handling
//!
//! Two error families live here:
//!
//! - [`AppError`]: what an HTTP handler returns. It implements `ResponseError`
//!   so actix turns it into a JSON error body with the right status code.
//! - [`SessionError`]: what goes wrong inside one translation session. Each
//!   variant knows the `errorCode` it is reported with on the wire and
//!   whether it ends the session.
//!
//! ## Session error policy:
//! Only a broken transport and a shut-down provider pool are fatal. Every
//! other error is reported to the client as an `ERROR` message and the
//! session stays open.

use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: No provider handle could be obtained (503 errors)
/// - **Timeout**: Processing budget exceeded (504 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
    Timeout(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timed out: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "audio file is empty",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "timeout", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Multipart error: {}", err))
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Protocol(_) => AppError::BadRequest(err.to_string()),
            SessionError::Validation(_)
            | SessionError::EmptyAudio
            | SessionError::NotInitialized
            | SessionError::AlreadyInitialized => AppError::ValidationError(err.to_string()),
            SessionError::Busy | SessionError::PoolClosed(_) => AppError::Unavailable(err.to_string()),
            SessionError::Timeout(_) => AppError::Timeout(err.to_string()),
            SessionError::Provider(_) | SessionError::Transport(_) => AppError::Internal(err.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Machine-readable code carried by every `ERROR` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolError,
    ValidationError,
    NotInitialized,
    AlreadyInitialized,
    EmptyAudio,
    PipelineBusy,
    ProviderError,
    Timeout,
    TransportError,
}

/// Everything that can go wrong while serving one session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The connection itself failed. Fatal.
    #[error("transport error: {0}")]
    Transport(String),

    /// A text frame could not be decoded into a protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio or an upload arrived before INIT.
    #[error("session is not initialized, send INIT first")]
    NotInitialized,

    /// A second INIT tried to replace the session configuration.
    #[error("session is already initialized")]
    AlreadyInitialized,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("audio payload is empty")]
    EmptyAudio,

    /// A pipeline is already running for this session.
    #[error("a pipeline is already running for this session")]
    Busy,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The provider pool was shut down. Fatal.
    #[error("provider pool closed: {0}")]
    PoolClosed(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Transport(_) => ErrorCode::TransportError,
            SessionError::Protocol(_) => ErrorCode::ProtocolError,
            SessionError::NotInitialized => ErrorCode::NotInitialized,
            SessionError::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            SessionError::Validation(_) => ErrorCode::ValidationError,
            SessionError::EmptyAudio => ErrorCode::EmptyAudio,
            SessionError::Busy => ErrorCode::PipelineBusy,
            SessionError::Provider(_) | SessionError::PoolClosed(_) => ErrorCode::ProviderError,
            SessionError::Timeout(_) => ErrorCode::Timeout,
        }
    }

    /// Whether the session has to be torn down after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::PoolClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_serialize_screaming_snake() {
        let code = serde_json::to_string(&ErrorCode::PipelineBusy).unwrap();
        assert_eq!(code, "\"PIPELINE_BUSY\"");
        assert_eq!(SessionError::EmptyAudio.code(), ErrorCode::EmptyAudio);
        assert_eq!(
            SessionError::PoolClosed("microsoft".into()).code(),
            ErrorCode::ProviderError
        );
    }

    #[test]
    fn test_only_transport_and_pool_shutdown_are_fatal() {
        assert!(SessionError::Transport("reset".into()).is_fatal());
        assert!(SessionError::PoolClosed("openai".into()).is_fatal());
        assert!(!SessionError::Timeout("budget".into()).is_fatal());
        assert!(!SessionError::Provider("503".into()).is_fatal());
        assert!(!SessionError::Busy.is_fatal());
        assert!(!SessionError::Protocol("bad json".into()).is_fatal());
    }

    #[test]
    fn test_session_error_maps_to_http_status() {
        let err: AppError = SessionError::Busy.into();
        assert_eq!(err.error_response().status(), 503);

        let err: AppError = SessionError::EmptyAudio.into();
        assert_eq!(err.error_response().status(), 400);

        let err: AppError = SessionError::Timeout("60s".into()).into();
        assert_eq!(err.error_response().status(), 504);
    }
}
