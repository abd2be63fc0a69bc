//! # Configuration Management
//!
//! This module loads the relay configuration from several sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_POOL__MAX_TOTAL`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket listener binds
//! - **session**: idle timeout, heartbeat and reaper intervals
//! - **codec**: message size threshold and chunk size for the wire protocol
//! - **pipeline**: processing budget, silence detection and fallback policy
//! - **pool**: sizing of the per-provider handle pools
//! - **providers**: credentials and defaults for each speech backend
//!
//! Durations are stored as plain integers (seconds or milliseconds, as the
//! field name says) so they stay easy to set from the environment. Each
//! section exposes `Duration` accessors for the code that consumes them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: `Serialize` lets the `config` crate seed itself from
///   `AppConfig::default()`, `Deserialize` turns the merged sources back into this struct
/// - **Clone**: the HTTP workers and the WebSocket actors each keep their own copy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub codec: CodecConfig,
    pub pipeline: PipelineConfig,
    pub pool: PoolConfig,
    pub providers: ProvidersConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session lifecycle timings.
///
/// ## Fields:
/// - `idle_timeout_secs`: a session with no client activity for this long is closed by the reaper
/// - `heartbeat_interval_secs`: how often every live session receives a `PING`
/// - `reaper_interval_secs`: how often idle sessions are looked for
/// - `pong_timeout_secs`: how long a session may sit in `AWAITING_HEARTBEAT`
///   before the next heartbeat sweep treats it as unreachable
/// - `max_frame_bytes`: largest WebSocket frame the transport accepts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub reaper_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

/// Wire protocol size limits.
///
/// ## Fields:
/// - `max_message_bytes`: serialized messages above this are split into chunks
/// - `chunk_bytes`: upper bound for the payload slice carried by one chunk
/// - `reassembly_timeout_secs`: an incomplete inbound chunk sequence older than this is dropped
/// - `max_reassembly_bytes`: an inbound chunk sequence growing past this is rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    pub max_message_bytes: usize,
    pub chunk_bytes: usize,
    pub reassembly_timeout_secs: u64,
    pub max_reassembly_bytes: usize,
}

impl CodecConfig {
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }
}

/// Pipeline budget, silence detection and degradation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Hard ceiling for one recognize → translate → synthesize run
    pub processing_budget_secs: u64,

    /// Inactivity after a partial result that ends continuous recognition
    pub silence_threshold_ms: u64,

    /// How often the silence watchdog looks at the activity clock
    pub silence_check_interval_ms: u64,

    /// Multiple of the silence threshold after which recognition ends even
    /// without any partial result
    pub absolute_silence_multiplier: u32,

    /// Longest text (in characters) handed to the synthesizer
    pub max_synthesis_chars: usize,

    /// Text used when recognition produced nothing usable
    pub fallback_text: String,

    /// Recognizer outputs that mean "nothing recognized"
    pub unrecognized_markers: Vec<String>,

    /// Timeout and retry policy applied to every provider stage
    pub stage: StagePolicyConfig,
}

impl PipelineConfig {
    pub fn processing_budget(&self) -> Duration {
        Duration::from_secs(self.processing_budget_secs)
    }

    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn silence_check_interval(&self) -> Duration {
        Duration::from_millis(self.silence_check_interval_ms)
    }
}

/// Per-stage provider call policy.
///
/// A transient failure is retried `max_retries` times, waiting
/// `backoff_ms * attempt` before each retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePolicyConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

/// Sizing of the handle pool each provider borrows from.
///
/// ## Fields:
/// - `max_total`: handles alive at once (idle + borrowed)
/// - `max_idle`: idle handles kept for reuse, extras are destroyed on return
/// - `min_idle`: idle handles created up front
/// - `max_wait_ms`: how long `borrow` waits when every handle is out
/// - `block_when_exhausted`: `false` makes an exhausted pool fail immediately
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_total: usize,
    pub max_idle: usize,
    pub min_idle: usize,
    pub max_wait_ms: u64,
    pub block_when_exhausted: bool,
}

impl PoolConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Speech backends and the one used when a session does not pick one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub default_provider: String,
    pub microsoft: MicrosoftConfig,
    pub openai: OpenAiConfig,
}

/// Azure Speech + Translator credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrosoftConfig {
    pub subscription_key: String,
    pub region: String,
    pub translator_key: String,
    pub translator_region: String,
    pub translator_endpoint: String,
    pub default_voice: String,
}

/// OpenAI audio + chat credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub transcription_model: String,
    pub translation_model: String,
    pub tts_model: String,
    pub default_voice: String,
    pub speed: f32,
}

/// Names accepted for `providers.default_provider`.
pub const KNOWN_PROVIDERS: [&str; 2] = ["microsoft", "openai"];

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// The relay starts with no configuration file at all; only the provider
/// credentials have to come from the environment.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            session: SessionConfig {
                idle_timeout_secs: 600,       // 10 minutes
                heartbeat_interval_secs: 30,
                reaper_interval_secs: 60,
                pong_timeout_secs: 10,
                max_frame_bytes: 16 * 1024 * 1024,
            },
            codec: CodecConfig {
                max_message_bytes: 1024 * 1024,  // 1 MiB
                chunk_bytes: 500 * 1024,         // 500 KiB
                reassembly_timeout_secs: 30,
                max_reassembly_bytes: 32 * 1024 * 1024,
            },
            pipeline: PipelineConfig {
                processing_budget_secs: 60,
                silence_threshold_ms: 3000,
                silence_check_interval_ms: 500,
                absolute_silence_multiplier: 3,
                max_synthesis_chars: 1000,
                fallback_text: "Speech could not be recognized".to_string(),
                unrecognized_markers: vec![
                    "无法识别语音内容".to_string(),
                    "[unrecognized]".to_string(),
                ],
                stage: StagePolicyConfig {
                    timeout_secs: 20,
                    max_retries: 1,
                    backoff_ms: 250,
                },
            },
            pool: PoolConfig {
                max_total: 8,
                max_idle: 4,
                min_idle: 1,
                max_wait_ms: 5000,
                block_when_exhausted: true,
            },
            providers: ProvidersConfig {
                default_provider: "microsoft".to_string(),
                microsoft: MicrosoftConfig {
                    subscription_key: String::new(),
                    region: "eastus".to_string(),
                    translator_key: String::new(),
                    translator_region: String::new(),
                    translator_endpoint: "https://api.cognitive.microsofttranslator.com".to_string(),
                    default_voice: "en-US-JennyNeural".to_string(),
                },
                openai: OpenAiConfig {
                    api_key: String::new(),
                    base_url: "https://api.openai.com/v1".to_string(),
                    transcription_model: "whisper-1".to_string(),
                    translation_model: "gpt-4o-mini".to_string(),
                    tts_model: "tts-1".to_string(),
                    default_voice: "alloy".to_string(),
                    speed: 1.0,
                },
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_PIPELINE__PROCESSING_BUDGET_SECS=30`: Shorter budget
    /// - `APP_PROVIDERS__MICROSOFT__SUBSCRIPTION_KEY=...`: Azure key
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Every interval and timeout is non-zero
    /// - A chunk can hold at least one 4-byte UTF-8 code point and is not
    ///   larger than the message threshold it exists to stay under
    /// - Pool sizes are ordered `min_idle <= max_idle <= max_total`
    /// - The default provider is one the relay knows how to build
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let session = &self.session;
        if session.idle_timeout_secs == 0
            || session.heartbeat_interval_secs == 0
            || session.reaper_interval_secs == 0
            || session.pong_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("Session timeouts and intervals must be greater than 0"));
        }

        if self.codec.chunk_bytes < 4 {
            return Err(anyhow::anyhow!("Chunk size must be at least 4 bytes"));
        }

        if self.codec.chunk_bytes > self.codec.max_message_bytes {
            return Err(anyhow::anyhow!(
                "Chunk size ({}) cannot exceed the max message size ({})",
                self.codec.chunk_bytes,
                self.codec.max_message_bytes
            ));
        }

        if self.codec.reassembly_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Reassembly timeout must be greater than 0"));
        }

        let pipeline = &self.pipeline;
        if pipeline.processing_budget_secs == 0
            || pipeline.silence_threshold_ms == 0
            || pipeline.silence_check_interval_ms == 0
        {
            return Err(anyhow::anyhow!("Pipeline budget and silence timings must be greater than 0"));
        }

        if pipeline.absolute_silence_multiplier == 0 {
            return Err(anyhow::anyhow!("Absolute silence multiplier must be at least 1"));
        }

        if pipeline.max_synthesis_chars == 0 {
            return Err(anyhow::anyhow!("Max synthesis length must be greater than 0"));
        }

        if pipeline.fallback_text.trim().is_empty() {
            return Err(anyhow::anyhow!("Fallback text cannot be empty"));
        }

        if pipeline.stage.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Stage timeout must be greater than 0"));
        }

        let pool = &self.pool;
        if pool.max_total == 0 {
            return Err(anyhow::anyhow!("Pool max_total must be greater than 0"));
        }

        if pool.max_idle > pool.max_total {
            return Err(anyhow::anyhow!("Pool max_idle cannot exceed max_total"));
        }

        if pool.min_idle > pool.max_idle {
            return Err(anyhow::anyhow!("Pool min_idle cannot exceed max_idle"));
        }

        let default_provider = self.providers.default_provider.to_lowercase();
        if !KNOWN_PROVIDERS.contains(&default_provider.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown default provider '{}' (expected one of {:?})",
                self.providers.default_provider,
                KNOWN_PROVIDERS
            ));
        }

        Ok(())
    }
}
