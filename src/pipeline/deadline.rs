//! Shared expiry record for events that may go stale while queued or while
//! waiting on a downstream stage.
//!
//! A `Deadline` is a counted handle: `attach()` hands out another holder,
//! `detach()` (or dropping a holder) releases one, and the record is freed
//! when the last holder goes away. Nothing can reach it afterwards; a
//! [`WeakDeadline`] observes that instead of dangling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Tracker {
    expires_at: Instant,
    // Sticky: once set it is never cleared.
    timed_out: AtomicBool,
}

impl Drop for Tracker {
    fn drop(&mut self) {
        tracing::trace!(timed_out = self.timed_out.load(Ordering::Relaxed), "deadline released");
    }
}

#[derive(Debug)]
pub struct Deadline {
    inner: Arc<Tracker>,
}

impl Deadline {
    pub fn at(expires_at: Instant) -> Self {
        Self {
            inner: Arc::new(Tracker {
                expires_at,
                timed_out: AtomicBool::new(false),
            }),
        }
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// Register another holder of the same record.
    pub fn attach(&self) -> Deadline {
        Deadline {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Release this holder. The record is freed when the last one detaches.
    pub fn detach(self) {
        drop(self);
    }

    /// Checked lazily against the clock; a `true` answer is cached and never flips back.
    pub fn has_expired(&self) -> bool {
        if self.inner.timed_out.load(Ordering::Acquire) {
            return true;
        }
        if Instant::now() >= self.inner.expires_at {
            self.inner.timed_out.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn expires_at(&self) -> Instant {
        self.inner.expires_at
    }

    /// Number of live holders.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn downgrade(&self) -> WeakDeadline {
        WeakDeadline(Arc::downgrade(&self.inner))
    }
}

/// Non-holding observer; it does not keep the record alive.
#[derive(Debug, Clone)]
pub struct WeakDeadline(Weak<Tracker>);

impl WeakDeadline {
    pub fn is_released(&self) -> bool {
        self.0.strong_count() == 0
    }

    pub fn upgrade(&self) -> Option<Deadline> {
        self.0.upgrade().map(|inner| Deadline { inner })
    }
}
