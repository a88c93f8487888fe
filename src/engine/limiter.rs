//! Concurrency limiter
//!
//! A token bucket callers can wrap around command batches. The engine itself
//! imposes no concurrency cap; this is the primitive for callers that want
//! one.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("no execution slots available")]
    Exhausted,

    #[error("limiter closed")]
    Closed,

    #[error("slot acquisition timed out")]
    Timeout,
}

/// Bounds the number of commands running at once.
///
/// Cloning shares the bucket.
#[derive(Clone)]
pub struct Limiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Limiter {
    /// A limiter with an explicit slot count.
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// A limiter sized to the host's CPU count.
    pub fn per_cpu() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a slot. The slot frees when the guard drops.
    pub async fn acquire(&self) -> Result<LimiterGuard, LimiterError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        Ok(LimiterGuard { _permit: permit })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Result<LimiterGuard, LimiterError> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(LimiterGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(LimiterError::Exhausted),
            Err(TryAcquireError::Closed) => Err(LimiterError::Closed),
        }
    }

    /// Wait for a slot, giving up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<LimiterGuard, LimiterError> {
        match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(LimiterGuard { _permit: permit }),
            Ok(Err(_)) => Err(LimiterError::Closed),
            Err(_) => Err(LimiterError::Timeout),
        }
    }
}

/// Releases its slot when dropped.
pub struct LimiterGuard {
    _permit: OwnedSemaphorePermit,
}
