//! # Heartbeat & Idle Reaper
//!
//! Two periodic sweeps over the [`SessionRegistry`]:
//!
//! - **Heartbeat** (every `heartbeat_interval_secs`): pings every live
//!   session. A session whose transport refuses the ping, or that left the
//!   previous ping unanswered past `pong_timeout_secs`, is evicted at once.
//! - **Reaper** (every `reaper_interval_secs`): closes sessions idle for
//!   longer than `idle_timeout_secs` with a normal close and an
//!   "idle timeout" reason, then drops expired inbound chunk sequences.
//!
//! Both loops stop when the shutdown token is cancelled.

use super::registry::SessionRegistry;
use super::transport::CloseCode;
use crate::config::SessionConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const IDLE_TIMEOUT_REASON: &str = "idle timeout";
pub const UNREACHABLE_REASON: &str = "heartbeat failed";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub pinged: usize,
    pub closed: usize,
}

pub struct SessionSweeper {
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
}

impl SessionSweeper {
    pub fn new(registry: Arc<SessionRegistry>, config: SessionConfig) -> Self {
        Self { registry, config }
    }

    pub fn heartbeat_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.registry.snapshot() {
            if !session.state().is_live() {
                continue;
            }
            report.checked += 1;

            if session.heartbeat_overdue(self.config.pong_timeout()) {
                warn!(session_id = %session.id, "No pong within timeout, evicting session");
                if self.registry.close_session(&session.id, Some((CloseCode::Away, UNREACHABLE_REASON))) {
                    report.closed += 1;
                }
                continue;
            }

            match session.outbox().heartbeat() {
                Ok(()) => {
                    session.ping_sent();
                    report.pinged += 1;
                }
                Err(_) => {
                    warn!(session_id = %session.id, "Heartbeat could not reach session, evicting");
                    if self.registry.close_session(&session.id, None) {
                        report.closed += 1;
                    }
                }
            }
        }

        if report.checked > 0 {
            debug!(checked = report.checked, pinged = report.pinged, closed = report.closed, "Heartbeat sweep");
        }
        report
    }

    pub fn reap_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let idle_timeout = self.config.idle_timeout();

        for session in self.registry.snapshot() {
            report.checked += 1;
            let idle = session.idle_for();
            if idle > idle_timeout {
                info!(session_id = %session.id, idle_secs = idle.as_secs(), "Closing idle session");
                if self
                    .registry
                    .close_session(&session.id, Some((CloseCode::Normal, IDLE_TIMEOUT_REASON)))
                {
                    report.closed += 1;
                }
            }
        }

        self.registry.chunks().purge_expired();
        report
    }

    /// Run both sweeps until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
            let mut reaper = tokio::time::interval(self.config.reaper_interval());
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick of an interval fires immediately
            heartbeat.tick().await;
            reaper.tick().await;

            info!(
                heartbeat_secs = self.config.heartbeat_interval_secs,
                reaper_secs = self.config.reaper_interval_secs,
                idle_timeout_secs = self.config.idle_timeout_secs,
                "Session sweeps started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = heartbeat.tick() => {
                        self.heartbeat_sweep();
                    }
                    _ = reaper.tick() => {
                        self.reap_sweep();
                    }
                }
            }

            info!("Session sweeps stopped");
        })
    }
}
