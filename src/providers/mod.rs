//! # Speech Providers
//!
//! A provider bundles the three engine calls the pipeline needs
//! (recognize, translate, synthesize) behind the [`SpeechProvider`] trait.
//! Implementations differ only in how they reach their backend.
//!
//! Every call runs on a [`ProviderHandle`] borrowed from the provider's own
//! [`HandlePool`](crate::pool::HandlePool). The handle carries credentials
//! and the per-call tuning (language, voice, output format) the adapter
//! sets before talking to its backend.

pub mod azure;
pub mod handle;
pub mod openai;
pub mod registry;

#[cfg(test)]
pub mod testing;

use crate::pipeline::silence::RecognitionProgress;
use crate::pool::PoolError;
use crate::protocol::AudioFormat;
use async_trait::async_trait;

pub use handle::ProviderHandle;
pub use registry::{ProviderEntry, ProviderRegistry};

/// How a provider finishes recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionStyle {
    /// One request, one answer.
    SingleShot,
    /// Streams partial results and may never signal the end on its own.
    /// The pipeline ends these with silence detection.
    Continuous,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider '{0}' is not configured")]
    NotConfigured(String),

    /// Recognition was cancelled by the engine without an error, e.g. end
    /// of stream. Carries whatever text had been recognized.
    #[error("recognition cancelled")]
    Cancelled { partial: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("{provider} returned HTTP {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("{stage} timed out after {elapsed_ms} ms")]
    Timeout { stage: &'static str, elapsed_ms: u64 },
}

impl ProviderError {
    /// Worth retrying after a short backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout { .. } => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Pool(PoolError::Exhausted { .. }) => true,
            _ => false,
        }
    }

    /// The handle's credentials were rejected, so it should not be reused.
    pub fn invalidates_handle(&self) -> bool {
        matches!(self, ProviderError::Api { status: 401 | 403, .. })
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// One speech backend.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: async methods in a trait used as `dyn SpeechProvider`
/// - **Send + Sync**: adapters are shared by every session through an `Arc`
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend has what it needs (credentials) to be called.
    fn is_available(&self) -> bool;

    fn recognition_style(&self) -> RecognitionStyle {
        RecognitionStyle::SingleShot
    }

    /// Speech to text. Continuous providers report partial results through
    /// `progress` as they arrive.
    async fn recognize(
        &self,
        handle: &mut ProviderHandle,
        audio: &[u8],
        language: &str,
        progress: &RecognitionProgress,
    ) -> Result<String, ProviderError>;

    async fn translate(
        &self,
        handle: &mut ProviderHandle,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, ProviderError>;

    async fn synthesize(
        &self,
        handle: &mut ProviderHandle,
        text: &str,
        language: &str,
        voice: Option<&str>,
        format: AudioFormat,
    ) -> Result<Vec<u8>, ProviderError>;
}

/// Read an error body as text, keeping the message short for logs.
pub(crate) async fn api_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > 512 {
        let mut cut = 512;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    ProviderError::Api {
        provider: provider.to_string(),
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let api = |status| ProviderError::Api {
            provider: "microsoft".into(),
            status,
            message: String::new(),
        };
        assert!(api(503).is_transient());
        assert!(api(429).is_transient());
        assert!(!api(400).is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(!ProviderError::NotConfigured("openai".into()).is_transient());
        assert!(!ProviderError::Pool(PoolError::Closed { pool: "p".into() }).is_transient());
    }

    #[test]
    fn test_rejected_credentials_invalidate_handle() {
        let api = |status| ProviderError::Api {
            provider: "openai".into(),
            status,
            message: String::new(),
        };
        assert!(api(401).invalidates_handle());
        assert!(api(403).invalidates_handle());
        assert!(!api(500).invalidates_handle());
    }
}
