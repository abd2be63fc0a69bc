//! # Resource Pool
//!
//! A bounded pool of provider handles (credentials plus per-call tuning).
//! Every provider call borrows one handle, uses it alone, and gives it back.
//!
//! ## How it is bounded:
//! - A `tokio::sync::Semaphore` with `max_total` permits caps handles in
//!   existence. Borrowing takes a permit first, so a borrower waits (up to
//!   `max_wait`) or fails fast when every handle is out.
//! - Idle handles sit in a `VecDeque` behind a `parking_lot::Mutex`. At most
//!   `max_idle` are kept; `min_idle` are created up front.
//!
//! ## Rust Concepts:
//! - **RAII guard**: [`Lease`] returns its handle in `Drop`, so every exit path
//!   (success, `?`, panic, task cancellation) gives the handle back
//! - **Associated types**: [`HandleFactory::Handle`] lets one pool type serve
//!   any handle the factory produces
//! - **OwnedSemaphorePermit**: the permit lives inside the lease and is
//!   released when the lease drops

use crate::config::PoolConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool '{pool}' exhausted after waiting {waited_ms} ms")]
    Exhausted { pool: String, waited_ms: u64 },

    #[error("pool '{pool}' is closed")]
    Closed { pool: String },

    #[error("pool '{pool}' failed to create a handle: {reason}")]
    Create { pool: String, reason: String },
}

/// Creates, checks and destroys the handles a pool hands out.
pub trait HandleFactory: Send + Sync + 'static {
    type Handle: Send + 'static;

    fn create(&self) -> Result<Self::Handle, String>;

    /// Called before an idle handle is reused and when a handle comes back.
    fn validate(&self, _handle: &Self::Handle) -> bool {
        true
    }

    fn destroy(&self, _handle: Self::Handle) {}
}

/// Point-in-time pool counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub max_total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrows: u64,
    pub exhausted: u64,
    pub closed: bool,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    borrows: AtomicU64,
    exhausted: AtomicU64,
}

pub struct HandlePool<F: HandleFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<F::Handle>>,
    closed: AtomicBool,
    counters: Counters,
}

impl<F: HandleFactory> HandlePool<F> {
    /// Build a pool and create its `min_idle` handles.
    pub fn new(name: impl Into<String>, factory: F, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            name: name.into(),
            factory,
            permits: Arc::new(Semaphore::new(config.max_total)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_idle)),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        });
        pool.prefill();
        pool
    }

    fn prefill(&self) {
        let target = self.config.min_idle.min(self.config.max_idle);
        let mut idle = self.idle.lock();
        while idle.len() < target {
            match self.create_handle() {
                Ok(handle) => idle.push_back(handle),
                Err(err) => {
                    warn!(pool = %self.name, error = %err, "Could not prefill pool");
                    break;
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Borrow a handle, waiting up to `max_wait` when the pool is exhausted
    /// (or failing at once if `block_when_exhausted` is off).
    pub async fn borrow(self: &Arc<Self>) -> Result<Lease<F>, PoolError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let permit = self.acquire_permit().await?;

        // close() may have run while we waited
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let handle = match self.take_idle() {
            Some(handle) => handle,
            None => self.create_handle()?,
        };

        self.counters.borrows.fetch_add(1, Ordering::Relaxed);
        Ok(Lease {
            handle: Some(handle),
            pool: Arc::clone(self),
            invalid: false,
            _permit: permit,
        })
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        let permits = Arc::clone(&self.permits);

        if !self.config.block_when_exhausted {
            return match permits.try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => Err(self.exhausted(Duration::ZERO)),
                Err(TryAcquireError::Closed) => Err(self.closed_error()),
            };
        }

        let max_wait = self.config.max_wait();
        match tokio::time::timeout(max_wait, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(self.exhausted(max_wait)),
        }
    }

    fn take_idle(&self) -> Option<F::Handle> {
        let mut idle = self.idle.lock();
        while let Some(handle) = idle.pop_front() {
            if self.factory.validate(&handle) {
                return Some(handle);
            }
            debug!(pool = %self.name, "Discarding idle handle that failed validation");
            self.destroy_handle(handle);
        }
        None
    }

    fn create_handle(&self) -> Result<F::Handle, PoolError> {
        let handle = self.factory.create().map_err(|reason| PoolError::Create {
            pool: self.name.clone(),
            reason,
        })?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn destroy_handle(&self, handle: F::Handle) {
        self.factory.destroy(handle);
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn give_back(&self, handle: F::Handle, invalid: bool) {
        if invalid || self.is_closed() || !self.factory.validate(&handle) {
            self.destroy_handle(handle);
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push_back(handle);
        } else {
            drop(idle);
            self.destroy_handle(handle);
        }
    }

    fn exhausted(&self, waited: Duration) -> PoolError {
        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        PoolError::Exhausted {
            pool: self.name.clone(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            pool: self.name.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut the pool down: later borrows fail fast, idle handles are
    /// destroyed now, borrowed handles are destroyed when they come back.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();

        let drained: Vec<F::Handle> = self.idle.lock().drain(..).collect();
        let count = drained.len();
        for handle in drained {
            self.destroy_handle(handle);
        }
        debug!(pool = %self.name, destroyed = count, "Pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let closed = self.is_closed();
        let in_use = if closed {
            0
        } else {
            self.config.max_total.saturating_sub(self.permits.available_permits())
        };
        PoolStats {
            name: self.name.clone(),
            max_total: self.config.max_total,
            idle: self.idle.lock().len(),
            in_use,
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            borrows: self.counters.borrows.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            closed,
        }
    }
}

/// A borrowed handle. Dropping the lease returns the handle to its pool.
pub struct Lease<F: HandleFactory> {
    handle: Option<F::Handle>,
    pool: Arc<HandlePool<F>>,
    invalid: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: HandleFactory> Lease<F> {
    /// Destroy the handle on release instead of reusing it.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn pool_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl<F: HandleFactory> Deref for Lease<F> {
    type Target = F::Handle;

    fn deref(&self) -> &Self::Target {
        // only None inside drop()
        self.handle.as_ref().expect("lease handle present until drop")
    }
}

impl<F: HandleFactory> DerefMut for Lease<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_mut().expect("lease handle present until drop")
    }
}

impl<F: HandleFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(handle, self.invalid);
        }
    }
}
