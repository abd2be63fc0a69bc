//! Named provider lookup.
//!
//! Sessions pick a provider by name in their config. Names are matched
//! case-insensitively; an unset name selects the default, and an unknown
//! name logs a warning and also selects the default.

use super::azure::AzureSpeechProvider;
use super::handle::{Credentials, ProviderHandleFactory, ProviderPool};
use super::openai::OpenAiSpeechProvider;
use super::SpeechProvider;
use crate::config::AppConfig;
use crate::pool::{HandlePool, PoolStats};
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Calls made on one handle before it is replaced.
const HANDLE_MAX_USES: u64 = 500;

/// An adapter together with the pool its calls borrow from.
#[derive(Clone)]
pub struct ProviderEntry {
    pub adapter: Arc<dyn SpeechProvider>,
    pub pool: Arc<ProviderPool>,
}

impl ProviderEntry {
    pub fn name(&self) -> &str {
        self.adapter.name()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub available: bool,
    pub is_default: bool,
    pub pool: PoolStats,
}

pub struct ProviderRegistry {
    entries: BTreeMap<String, ProviderEntry>,
    default_name: String,
}

impl ProviderRegistry {
    pub fn new(default_name: &str) -> Self {
        Self {
            entries: BTreeMap::new(),
            default_name: default_name.to_lowercase(),
        }
    }

    /// Build the Azure and OpenAI adapters with one pool each.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let providers = &config.providers;
        let mut registry = Self::new(&providers.default_provider);

        let azure = AzureSpeechProvider::new(providers.microsoft.clone())?;
        let azure_credentials = Credentials {
            api_key: providers.microsoft.subscription_key.clone(),
            region: providers.microsoft.region.clone(),
            endpoint: providers.microsoft.translator_endpoint.clone(),
        };
        registry.register(Arc::new(azure), azure_credentials, config);

        let openai = OpenAiSpeechProvider::new(providers.openai.clone())?;
        let openai_credentials = Credentials {
            api_key: providers.openai.api_key.clone(),
            region: String::new(),
            endpoint: providers.openai.base_url.clone(),
        };
        registry.register(Arc::new(openai), openai_credentials, config);

        if registry.entries.get(&registry.default_name).is_none() {
            return Err(anyhow::anyhow!(
                "Default provider '{}' is not registered",
                registry.default_name
            ));
        }

        Ok(registry)
    }

    fn register(&mut self, adapter: Arc<dyn SpeechProvider>, credentials: Credentials, config: &AppConfig) {
        let name = adapter.name().to_lowercase();
        let factory = ProviderHandleFactory::new(name.clone(), credentials, HANDLE_MAX_USES);
        let pool = HandlePool::new(name.clone(), factory, config.pool.clone());
        info!(provider = %name, available = adapter.is_available(), "Registered speech provider");
        self.insert(ProviderEntry { adapter, pool });
    }

    /// Add an adapter with a pool that is already built.
    pub fn insert(&mut self, entry: ProviderEntry) {
        self.entries.insert(entry.name().to_lowercase(), entry);
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Find the provider for a session. `None` only when not even the
    /// default is registered.
    pub fn resolve(&self, requested: Option<&str>) -> Option<ProviderEntry> {
        let requested = requested.map(str::trim).filter(|name| !name.is_empty());

        if let Some(name) = requested {
            if let Some(entry) = self.entries.get(&name.to_lowercase()) {
                return Some(entry.clone());
            }
            warn!(
                requested = %name,
                fallback = %self.default_name,
                "Unsupported provider requested, using default"
            );
        }

        self.entries.get(&self.default_name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.entries
            .iter()
            .map(|(name, entry)| ProviderStatus {
                name: name.clone(),
                available: entry.adapter.is_available(),
                is_default: *name == self.default_name,
                pool: entry.pool.stats(),
            })
            .collect()
    }

    /// Close every pool. Used during shutdown.
    pub fn close_all(&self) {
        for entry in self.entries.values() {
            entry.pool.close();
        }
    }
}
