// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot countdown latch.
//!
//! The count only goes down. Reaching zero opens the gate for good: every
//! parked waiter is released and later waiters pass straight through.
//! An aborted wait leaves the count alone.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Result, SyncError};
use crate::monitor::{Monitor, Wait};

pub struct CountDownLatch {
    remaining: Arc<Monitor<usize>>,
}

impl CountDownLatch {
    /// Create a latch that opens after `count` calls to `count_down`.
    /// A zero count starts open.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Arc::new(Monitor::new(count)),
        }
    }

    /// Decrement the count, waking all waiters when it reaches zero.
    /// No effect once the latch is open.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        match *remaining {
            0 => {}
            1 => {
                *remaining = 0;
                tracing::debug!("latch opened");
                self.remaining.notify_all();
            }
            _ => *remaining -= 1,
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        // Only a token or deadline can abort a wait.
        let _ = self.wait_with(Wait::forever());
    }

    /// Block until the count reaches zero or `timeout` elapses.
    /// Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_with(Wait::timeout(timeout)).is_ok()
    }

    /// Block until the count reaches zero or `token` fires
    /// (`SyncError::Interrupted`).
    pub fn wait_cancellable(&self, token: &CancelToken) -> Result<()> {
        self.wait_with(Wait::cancellable(token))
    }

    fn wait_with(&self, wait: Wait<'_>) -> Result<()> {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return Ok(());
        }
        wait.begin(&self.remaining);
        tracing::trace!(remaining = *remaining, "latch wait parking");
        while *remaining > 0 {
            let (guard, abort) = self.remaining.park_for(remaining, &wait);
            remaining = guard;
            if let Some(abort) = abort {
                tracing::trace!(remaining = *remaining, %abort, "latch wait aborted");
                return Err(abort);
            }
        }
        Ok(())
    }

    /// Current count. Zero means open.
    pub fn count(&self) -> usize {
        self.remaining.read(|r| *r)
    }
}

impl TryFrom<i64> for CountDownLatch {
    type Error = SyncError;

    /// Checked constructor for counts coming from signed arithmetic.
    fn try_from(count: i64) -> Result<Self> {
        usize::try_from(count)
            .map(CountDownLatch::new)
            .map_err(|_| SyncError::invalid(format!("latch count must not be negative, got {count}")))
    }
}

impl std::fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountDownLatch")
            .field("count", &self.count())
            .finish()
    }
}
