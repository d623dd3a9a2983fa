//! Bound on simultaneous isolated render instances
//!
//! Admission never waits: when every slot is taken the caller is told to
//! come back later. A slot is held by a [`LimiterPermit`] and released when
//! the permit drops, so every exit path (success, error, panic, cancelled
//! future) gives it back exactly once.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One admitted slot
pub type LimiterPermit = OwnedSemaphorePermit;

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    slots: Arc<Semaphore>,
    max: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        let max = max.min(Semaphore::MAX_PERMITS);
        Self {
            slots: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Take a slot if one is free
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        self.slots.clone().try_acquire_owned().ok()
    }

    pub fn active(&self) -> usize {
        self.max - self.slots.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
