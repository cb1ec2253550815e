// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Monitor: a mutex-guarded state plus the condvar its waiters park on.
//!
//! Every blocking operation follows the same shape: lock, test the release
//! condition, park, re-test. Testing and parking happen under one lock, so a
//! notify can never slip in between. Poisoning is recovered; user callbacks
//! never run with the lock held, so the state is consistent after a panic.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::SyncError;

/// Something a cancellation token can wake.
pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

pub(crate) struct Monitor<S> {
    state: Mutex<S>,
    cond: Condvar,
}

impl<S> Monitor<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with shared access to the state.
    pub(crate) fn read<R, F: FnOnce(&S) -> R>(&self, f: F) -> R {
        f(&self.lock())
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Park until notified. Spurious wakeups are possible; callers loop.
    pub(crate) fn park<'a>(&'a self, guard: MutexGuard<'a, S>) -> MutexGuard<'a, S> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Park once under `wait`'s deadline and token.
    ///
    /// The abort check runs before parking, so a caller whose release
    /// condition already holds never sees an abort. Returns the abort reason
    /// when the wait should end without release.
    pub(crate) fn park_for<'a>(
        &'a self,
        guard: MutexGuard<'a, S>,
        wait: &Wait<'_>,
    ) -> (MutexGuard<'a, S>, Option<SyncError>) {
        if let Some(abort) = wait.check() {
            return (guard, Some(abort));
        }
        match wait.deadline {
            None => (self.park(guard), None),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                let (guard, _) = self
                    .cond
                    .wait_timeout(guard, left)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, None)
            }
        }
    }
}

impl<S: Send> Wake for Monitor<S> {
    fn wake(&self) {
        // Taking the lock orders this notify after the waiter has parked.
        let _guard = self.lock();
        self.cond.notify_all();
    }
}

/// How long a blocking call may park and who may interrupt it.
#[derive(Clone, Copy, Default)]
pub(crate) struct Wait<'t> {
    deadline: Option<Instant>,
    cancel: Option<&'t CancelToken>,
}

impl<'t> Wait<'t> {
    pub(crate) fn forever() -> Self {
        Self::default()
    }

    /// A deadline too far out to represent behaves like no deadline.
    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            cancel: None,
        }
    }

    pub(crate) fn cancellable(token: &'t CancelToken) -> Self {
        Self {
            deadline: None,
            cancel: Some(token),
        }
    }

    /// Hook `monitor` up to the token, if any. Call once, under the lock,
    /// before the first `park_for`.
    pub(crate) fn begin<S: Send + 'static>(&self, monitor: &Arc<Monitor<S>>) {
        if let Some(token) = self.cancel {
            let weak: Weak<dyn Wake> = Arc::downgrade(monitor) as Weak<dyn Wake>;
            token.watch(weak);
        }
    }

    fn check(&self) -> Option<SyncError> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Some(SyncError::Interrupted);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(SyncError::TimedOut),
            _ => None,
        }
    }
}
