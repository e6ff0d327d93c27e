//! Backpressure accounting for outbound frames.
//!
//! Every frame handed to the writer task occupies one slot until the task has
//! written and flushed it. When all slots are taken, senders wait for the
//! writer to catch up, up to a timeout.
//!
//! A serial link is slow compared to the producers feeding it (publishers
//! pushing updates, many subscriptions re-tuning at once), so this bound is
//! what keeps a stalled peer from growing the queue without limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Result, TelewireError};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 256;

/// Default backpressure timeout (how long to wait for space to become available).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Shared {
    pending: AtomicUsize,
    released: Notify,
}

/// Pending-frame counter shared between senders and the writer task.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    shared: Arc<Shared>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Create a controller with the default timeout.
    pub fn new(max_pending: usize) -> Self {
        Self::with_timeout(max_pending, DEFAULT_TIMEOUT)
    }

    /// Create a controller with a custom timeout.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: AtomicUsize::new(0),
                released: Notify::new(),
            }),
            max_pending: max_pending.max(1),
            timeout,
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    /// Get current pending count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Get maximum pending limit.
    #[inline]
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Try to reserve a slot without blocking.
    ///
    /// Returns `Err(BackpressureTimeout)` if at capacity.
    pub fn try_reserve(&self) -> Result<()> {
        self.shared
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pending).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|_| TelewireError::BackpressureTimeout)
    }

    /// Reserve a slot, waiting up to the configured timeout for one to free up.
    pub async fn reserve(&self) -> Result<()> {
        if self.try_reserve().is_ok() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            // Register before re-checking so a release in between is not lost.
            released.as_mut().enable();

            if self.try_reserve().is_ok() {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                tracing::warn!(
                    "Write queue full ({} frames pending), giving up",
                    self.pending_count()
                );
                return Err(TelewireError::BackpressureTimeout);
            }
        }
    }

    /// Release a slot (called after a frame is written or dropped).
    pub fn release(&self) {
        let _ = self
            .shared
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        self.shared.released.notify_waiters();
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
