//! Byte-budget backpressure for inbound messages.
//!
//! The read pump reserves budget for every inbound request before it is
//! queued for a receiver. The reservation is held by a
//! [`BackpressureGuard`] that travels with the queued message and is
//! released when a caller consumes it. Once the budget is exhausted the
//! read pump suspends, which in turn stops reading from the socket and
//! pushes back on the peer.
//!
//! # Configuration
//!
//! - `capacity`: total bytes that may sit unclaimed across all message types
//!   (default: 16 MB)
//!
//! A single message larger than the whole budget can never be admitted and
//! is reported as [`FramewireError::BufferTooSmall`].

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::error::{FramewireError, Result};

/// Default response buffer budget in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Shared byte budget.
///
/// Cloning shares the same budget.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl BackpressureController {
    /// Create a controller with `capacity` bytes of budget.
    ///
    /// Capacities above `u32::MAX` are clamped.
    pub fn new(capacity: usize) -> Self {
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
        Self {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Total budget in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Bytes currently free.
    #[inline]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Bytes currently reserved.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    /// Check if a reservation of `bytes` would have to wait.
    #[inline]
    pub fn is_active(&self, bytes: usize) -> bool {
        self.available() < bytes
    }

    fn checked_size(&self, bytes: usize) -> Result<u32> {
        match u32::try_from(bytes) {
            Ok(n) if n <= self.capacity => Ok(n),
            _ => Err(FramewireError::BufferTooSmall {
                required: bytes,
                capacity: self.capacity(),
            }),
        }
    }

    /// Reserve `bytes` without waiting.
    ///
    /// Returns `Ok(None)` if the budget is currently exhausted.
    pub fn try_reserve(&self, bytes: usize) -> Result<Option<BackpressureGuard>> {
        let n = self.checked_size(bytes)?;
        match self.permits.clone().try_acquire_many_owned(n) {
            Ok(permit) => Ok(Some(BackpressureGuard::new(permit, n))),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(FramewireError::Cancelled),
        }
    }

    /// Reserve `bytes`, waiting until enough budget is released.
    ///
    /// Waiters are served in FIFO order, so a large reservation is not
    /// starved by a stream of small ones.
    ///
    /// # Errors
    ///
    /// - `BufferTooSmall` if `bytes` exceeds the whole budget
    /// - `Cancelled` if `token` fires first
    pub async fn reserve(&self, bytes: usize, token: &CancellationToken) -> Result<BackpressureGuard> {
        let n = self.checked_size(bytes)?;

        tokio::select! {
            biased;
            permit = self.permits.clone().acquire_many_owned(n) => {
                let permit = permit.map_err(|_| FramewireError::Cancelled)?;
                Ok(BackpressureGuard::new(permit, n))
            }
            _ = token.cancelled() => Err(FramewireError::Cancelled),
        }
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// Reserved budget, released on drop.
#[derive(Debug)]
pub struct BackpressureGuard {
    permit: Option<OwnedSemaphorePermit>,
    bytes: usize,
}

impl BackpressureGuard {
    fn new(permit: OwnedSemaphorePermit, bytes: u32) -> Self {
        Self {
            permit: Some(permit),
            bytes: bytes as usize,
        }
    }

    /// Number of bytes held by this guard.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Manually release the reservation.
    pub fn release(mut self) {
        self.permit.take();
    }
}
