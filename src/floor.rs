//! Single-flight turn taking.
//!
//! A [`Floor`] lets exactly one caller at a time perform an upstream
//! operation. Callers queue in arrival order; a caller whose timeout expires
//! while queued leaves without ever holding the floor. Releasing happens when
//! the [`FloorGuard`] drops, which wakes the next caller in line.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use telewire::floor::Floor;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> telewire::Result<()> {
//! let floor = Floor::new();
//! let guard = floor.acquire(Duration::from_millis(100)).await?;
//! assert!(floor.is_held());
//! drop(guard);
//! assert!(!floor.is_held());
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, TelewireError};

/// FIFO single-holder lock with timed acquisition.
#[derive(Debug, Clone)]
pub struct Floor {
    permit: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// Proof of holding the floor. Dropping it passes the floor on.
#[derive(Debug)]
pub struct FloorGuard {
    _permit: OwnedSemaphorePermit,
}

/// Counts a caller as queued for as long as it exists.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Floor {
    /// Create a free floor.
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for the floor, giving up after `timeout`.
    ///
    /// Fails with `FloorTimeout` if the floor did not come free in time.
    pub async fn acquire(&self, timeout: Duration) -> Result<FloorGuard> {
        if let Ok(permit) = self.permit.clone().try_acquire_owned() {
            return Ok(FloorGuard { _permit: permit });
        }

        let _waiting = Waiting::enter(&self.waiting);
        tracing::debug!("Floor busy, queueing behind {} waiters", self.waiting() - 1);

        match tokio::time::timeout(timeout, self.permit.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(FloorGuard { _permit: permit }),
            // The semaphore is never closed.
            Ok(Err(_)) => Err(TelewireError::ConnectionClosed),
            Err(_) => Err(TelewireError::FloorTimeout),
        }
    }

    /// Check whether someone holds the floor.
    pub fn is_held(&self) -> bool {
        self.permit.available_permits() == 0
    }

    /// Number of callers queued for the floor.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

impl Default for Floor {
    fn default() -> Self {
        Self::new()
    }
}
