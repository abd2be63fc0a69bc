//! Pooled per-call provider configuration.

use crate::pool::{HandleFactory, HandlePool, Lease};
use crate::protocol::AudioFormat;
use std::sync::atomic::{AtomicU64, Ordering};

pub type ProviderPool = HandlePool<ProviderHandleFactory>;
pub type ProviderLease = Lease<ProviderHandleFactory>;

/// What a handle needs to authenticate against its backend.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub region: String,
    pub endpoint: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.api_key.is_empty() { "<empty>" } else { "<redacted>" })
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// One borrowed configuration object.
///
/// Tuning fields are overwritten by the adapter at the start of each call,
/// so a reused handle never leaks one session's settings into another.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub id: u64,
    pub provider: String,
    pub credentials: Credentials,
    pub language: Option<String>,
    pub voice: Option<String>,
    pub output_format: AudioFormat,
    pub uses: u64,
}

impl ProviderHandle {
    /// Apply the tuning for the next call.
    pub fn tune(&mut self, language: Option<&str>, voice: Option<&str>, format: AudioFormat) {
        self.language = language.map(str::to_string);
        self.voice = voice.map(str::to_string);
        self.output_format = format;
        self.uses += 1;
    }
}

/// Builds handles for one provider from its configured credentials.
#[derive(Debug)]
pub struct ProviderHandleFactory {
    provider: String,
    credentials: Credentials,
    max_uses: u64,
    next_id: AtomicU64,
}

impl ProviderHandleFactory {
    pub fn new(provider: impl Into<String>, credentials: Credentials, max_uses: u64) -> Self {
        Self {
            provider: provider.into(),
            credentials,
            max_uses,
            next_id: AtomicU64::new(1),
        }
    }
}

impl HandleFactory for ProviderHandleFactory {
    type Handle = ProviderHandle;

    fn create(&self) -> Result<ProviderHandle, String> {
        if self.credentials.api_key.is_empty() {
            return Err(format!("no credentials configured for '{}'", self.provider));
        }
        Ok(ProviderHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            provider: self.provider.clone(),
            credentials: self.credentials.clone(),
            language: None,
            voice: None,
            output_format: AudioFormat::default(),
            uses: 0,
        })
    }

    /// Handles are rotated after `max_uses` calls.
    fn validate(&self, handle: &ProviderHandle) -> bool {
        handle.uses < self.max_uses
    }

    fn destroy(&self, handle: ProviderHandle) {
        tracing::trace!(provider = %handle.provider, handle_id = handle.id, uses = handle.uses, "Destroyed provider handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(key: &str) -> Credentials {
        Credentials {
            api_key: key.into(),
            region: "westeurope".into(),
            endpoint: String::new(),
        }
    }

    #[test]
    fn test_missing_key_fails_creation() {
        let factory = ProviderHandleFactory::new("microsoft", credentials(""), 10);
        assert!(factory.create().is_err());
    }

    #[test]
    fn test_handles_rotate_after_max_uses() {
        let factory = ProviderHandleFactory::new("microsoft", credentials("k"), 2);
        let mut handle = factory.create().unwrap();
        assert!(factory.validate(&handle));

        handle.tune(Some("en-US"), None, AudioFormat::Mp3);
        handle.tune(Some("de-DE"), Some("de-DE-KatjaNeural"), AudioFormat::Wav);
        assert_eq!(handle.language.as_deref(), Some("de-DE"));
        assert!(!factory.validate(&handle));
    }

    #[test]
    fn test_debug_redacts_key() {
        let printed = format!("{:?}", credentials("secret-key"));
        assert!(!printed.contains("secret-key"));
        assert!(printed.contains("<redacted>"));
    }
}
