//! Ordered throttling primitives wrapped around every backend request.
//!
//! A mutex is just a counting semaphore with capacity 1, so the whole
//! configuration is a single list of semaphores. The list is acquired in
//! declaration order before a request goes out and every permit is released
//! together once the response, including a streamed body, has completed.
//! Uniform acquisition order across all callers is what excludes deadlock.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// An ordered list of counting semaphores gating backend requests.
///
/// Typical configuration: the per-session semaphore first
/// (`num_connections_per_session`), the process-wide semaphore second
/// (`num_persistent_connections`). A capacity of zero disables the
/// corresponding lock.
#[derive(Clone, Debug, Default)]
pub struct Throttle {
    locks: Vec<Arc<Semaphore>>,
}

/// The permits held for one in-flight request. Dropping it releases every
/// lock; for streaming responses it is moved into the body wrapper so the
/// locks stay held until the last byte.
#[derive(Debug)]
pub struct ThrottlePermit {
    _permits: Vec<OwnedSemaphorePermit>,
}

impl Throttle {
    /// Builds a throttle from pre-shared semaphores, kept in the given order.
    pub fn new(locks: Vec<Arc<Semaphore>>) -> Self {
        Throttle { locks }
    }

    /// Acquires all locks in list order. Acquisition is non-revocable: there
    /// is no timeout on the acquire itself.
    pub async fn acquire(&self) -> ThrottlePermit {
        let mut permits = Vec::with_capacity(self.locks.len());
        for lock in &self.locks {
            // The semaphores are never closed, so acquire cannot fail.
            if let Ok(permit) = Arc::clone(lock).acquire_owned().await {
                permits.push(permit);
            }
        }
        ThrottlePermit { _permits: permits }
    }
}
