//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every request handler and every session task holds a clone of the same
//!   registries and counters; the data is freed when the last clone drops
//!
//! ### Atomics instead of a locked metrics struct
//! - Counters are bumped from many tasks at once. `AtomicU64::fetch_add`
//!   needs no lock, so a hot pipeline never waits on the metrics endpoint
//!
//! ### Arc<RwLock<T>> Pattern
//! - The configuration is read far more often than it is replaced, so it
//!   sits behind a reader-writer lock (`parking_lot`, which cannot be poisoned)

use crate::config::AppConfig;
use crate::pipeline::{PipelineOrchestrator, PipelineOutcome};
use crate::protocol::MessageCodec;
use crate::providers::ProviderRegistry;
use crate::session::{SessionRegistry, SessionServices};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,

    pub metrics: Arc<RelayMetrics>,

    pub providers: Arc<ProviderRegistry>,

    pub sessions: Arc<SessionRegistry>,

    pub orchestrator: Arc<PipelineOrchestrator>,

    pub codec: Arc<MessageCodec>,

    pub start_time: Instant,

    /// Cancelled once at shutdown; background sweeps stop on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, providers: ProviderRegistry) -> Self {
        let metrics = Arc::new(RelayMetrics::default());
        let providers = Arc::new(providers);
        let codec = Arc::new(MessageCodec::new(&config.codec));
        let sessions = Arc::new(SessionRegistry::new(&config.codec));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::clone(&providers),
            &config.pipeline,
            Arc::clone(&metrics),
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            providers,
            sessions,
            orchestrator,
            codec,
            start_time: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// What a new WebSocket connection needs to run its session.
    pub fn services(&self) -> SessionServices {
        SessionServices {
            registry: Arc::clone(&self.sessions),
            orchestrator: Arc::clone(&self.orchestrator),
            codec: Arc::clone(&self.codec),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub pipelines_started: AtomicU64,
    pub pipelines_completed: AtomicU64,
    pub pipelines_degraded: AtomicU64,
    pub pipelines_rejected: AtomicU64,
    pub pipelines_timed_out: AtomicU64,
    pub pipelines_cancelled: AtomicU64,
    pub pipelines_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub pipelines_started: u64,
    pub pipelines_completed: u64,
    pub pipelines_degraded: u64,
    pub pipelines_rejected: u64,
    pub pipelines_timed_out: u64,
    pub pipelines_cancelled: u64,
    pub pipelines_failed: u64,
}

impl RelayMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &PipelineOutcome) {
        let counter = match outcome {
            PipelineOutcome::Completed => &self.pipelines_completed,
            PipelineOutcome::Degraded(_) => &self.pipelines_degraded,
            PipelineOutcome::Rejected(_) => &self.pipelines_rejected,
            PipelineOutcome::TimedOut => &self.pipelines_timed_out,
            PipelineOutcome::Cancelled => &self.pipelines_cancelled,
            PipelineOutcome::Failed(_) => &self.pipelines_failed,
        };
        Self::incr(counter);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_opened: load(&self.sessions_opened),
            sessions_closed: load(&self.sessions_closed),
            frames_in: load(&self.frames_in),
            frames_out: load(&self.frames_out),
            pipelines_started: load(&self.pipelines_started),
            pipelines_completed: load(&self.pipelines_completed),
            pipelines_degraded: load(&self.pipelines_degraded),
            pipelines_rejected: load(&self.pipelines_rejected),
            pipelines_timed_out: load(&self.pipelines_timed_out),
            pipelines_cancelled: load(&self.pipelines_cancelled),
            pipelines_failed: load(&self.pipelines_failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn test_outcomes_land_in_their_counters() {
        let metrics = RelayMetrics::default();
        metrics.record_outcome(&PipelineOutcome::Completed);
        metrics.record_outcome(&PipelineOutcome::TimedOut);
        metrics.record_outcome(&PipelineOutcome::Rejected(SessionError::EmptyAudio));
        metrics.record_outcome(&PipelineOutcome::Completed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pipelines_completed, 2);
        assert_eq!(snapshot.pipelines_timed_out, 1);
        assert_eq!(snapshot.pipelines_rejected, 1);
        assert_eq!(snapshot.pipelines_failed, 0);
    }

    #[tokio::test]
    async fn test_state_wires_shared_services() {
        let config = AppConfig::default();
        let providers = ProviderRegistry::from_config(&config).unwrap();
        let state = AppState::new(config, providers);

        let services = state.services();
        assert!(Arc::ptr_eq(&services.registry, &state.sessions));
        assert!(Arc::ptr_eq(&services.metrics, &state.metrics));
        assert_eq!(state.get_config().server.port, state.config.read().server.port);
    }
}
