// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation of blocked waits.
//!
//! AtomicBool flag plus the monitors currently parked on the token. Firing
//! the token sets the flag first, then wakes every live monitor, so a waiter
//! either sees the flag before parking or is parked when the wakeup lands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, Weak};

use crate::monitor::Wake;

/// Cancellation token shared between a waiting thread and whoever may
/// abort its wait.
pub struct CancelToken {
    flag: AtomicBool,
    watchers: Mutex<Vec<Weak<dyn Wake>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Set the cancellation flag and wake every monitor parked on this token.
    pub fn cancel(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        // Drop the list lock before waking: `wake` takes the monitor lock,
        // and waiters take this lock while holding theirs.
        let watchers = std::mem::take(
            &mut *self.watchers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        tracing::trace!(watchers = watchers.len(), "cancel token fired");
        for watcher in watchers.iter().filter_map(Weak::upgrade) {
            watcher.wake();
        }
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Remember `monitor` so `cancel` can wake it. Dead entries are pruned.
    pub(crate) fn watch(&self, monitor: Weak<dyn Wake>) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|w| w.strong_count() > 0);
        if !watchers.iter().any(|w| Weak::ptr_eq(w, &monitor)) {
            watchers.push(monitor);
        }
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
