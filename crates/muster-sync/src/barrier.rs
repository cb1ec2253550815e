// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cyclic barrier with an optional barrier action.
//!
//! A fixed number of parties rendezvous per generation. The last arriver
//! (the trigger) runs the action, then opens a fresh generation and wakes
//! everyone. A trip is all-or-nothing: if one waiter times out, is cancelled,
//! or the action panics, the whole generation breaks and stays broken until
//! `reset`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{panic_message, Result, SyncError};
use crate::monitor::{Monitor, Wait};

type BarrierAction = Box<dyn Fn() + Send + Sync>;

/// One cycle of the barrier. Waiters hold on to the generation they entered
/// so a later reset cannot be mistaken for their trip.
struct Generation {
    id: u64,
    // Written only under the barrier lock.
    broken: AtomicBool,
}

impl Generation {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            broken: AtomicBool::new(false),
        })
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }
}

struct BarrierState {
    waiting: usize,
    generation: Arc<Generation>,
    /// Trigger thread running the action with the lock released.
    tripping: Option<ThreadId>,
}

impl BarrierState {
    fn is_tripping(&self) -> bool {
        self.tripping.is_some()
    }

    /// Calls from inside the action would wait on themselves.
    fn check_reentry(&self, op: &str) -> Result<()> {
        if self.tripping == Some(thread::current().id()) {
            return Err(SyncError::illegal(format!(
                "{op} called from inside the barrier action"
            )));
        }
        Ok(())
    }

    fn next_generation(&mut self) {
        self.waiting = 0;
        self.generation = Generation::new(self.generation.id + 1);
    }
}

pub struct CyclicBarrier {
    parties: usize,
    action: Option<BarrierAction>,
    state: Arc<Monitor<BarrierState>>,
}

impl CyclicBarrier {
    /// Create a barrier that trips once `parties` callers are waiting.
    pub fn new(parties: usize) -> Result<Self> {
        Self::build(parties, None)
    }

    /// Like `new`, with `action` run by the trigger before anyone is released.
    ///
    /// The action may read the barrier's counters. Calling `wait` or `reset`
    /// from inside it fails with `SyncError::IllegalState`.
    pub fn with_action<F>(parties: usize, action: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(parties, Some(Box::new(action)))
    }

    fn build(parties: usize, action: Option<BarrierAction>) -> Result<Self> {
        if parties == 0 {
            return Err(SyncError::invalid("barrier parties must be positive"));
        }
        Ok(Self {
            parties,
            action,
            state: Arc::new(Monitor::new(BarrierState {
                waiting: 0,
                generation: Generation::new(0),
                tripping: None,
            })),
        })
    }

    /// Wait until all parties have arrived.
    ///
    /// Returns the arrival index: `parties - 1` for the first arriver down to
    /// `0` for the trigger.
    pub fn wait(&self) -> Result<usize> {
        self.wait_with(Wait::forever())
    }

    /// Like `wait`, giving up with `SyncError::TimedOut` after `timeout`.
    /// Giving up breaks the barrier for everyone else.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<usize> {
        self.wait_with(Wait::timeout(timeout))
    }

    /// Like `wait`, giving up with `SyncError::Interrupted` when `token`
    /// fires. Giving up breaks the barrier for everyone else.
    pub fn wait_cancellable(&self, token: &CancelToken) -> Result<usize> {
        self.wait_with(Wait::cancellable(token))
    }

    fn wait_with(&self, wait: Wait<'_>) -> Result<usize> {
        let mut st = self.state.lock();
        st.check_reentry("wait")?;
        // Arrivals for the next generation hold off until the trip is published.
        while st.is_tripping() {
            st = self.state.park(st);
        }
        if st.generation.is_broken() {
            return Err(SyncError::BrokenBarrier);
        }

        let generation = st.generation.clone();
        st.waiting += 1;
        let index = self.parties - st.waiting;
        if index == 0 {
            return self.trip(st);
        }

        wait.begin(&self.state);
        tracing::trace!(generation = generation.id, index, "barrier wait parking");
        loop {
            if generation.is_broken() {
                return Err(SyncError::BrokenBarrier);
            }
            if !Arc::ptr_eq(&generation, &st.generation) {
                return Ok(index);
            }
            if st.is_tripping() {
                // The trigger has committed; timeouts no longer apply.
                st = self.state.park(st);
                continue;
            }
            let (guard, abort) = self.state.park_for(st, &wait);
            st = guard;
            if let Some(abort) = abort {
                tracing::warn!(generation = generation.id, index, %abort, "barrier wait aborted");
                self.break_generation(&mut st);
                return Err(abort);
            }
        }
    }

    /// Runs on the last arriver with the waiting count at `parties`.
    fn trip<'a>(&'a self, mut st: MutexGuard<'a, BarrierState>) -> Result<usize> {
        let outcome = match &self.action {
            None => Ok(()),
            Some(action) => {
                st.tripping = Some(thread::current().id());
                drop(st);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| action()));
                st = self.state.lock();
                st.tripping = None;
                outcome
            }
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(
                    generation = st.generation.id,
                    parties = self.parties,
                    "barrier tripped"
                );
                st.next_generation();
                self.state.notify_all();
                Ok(0)
            }
            Err(payload) => {
                let msg = panic_message(&*payload);
                tracing::warn!(generation = st.generation.id, %msg, "barrier action panicked");
                self.break_generation(&mut st);
                Err(SyncError::BarrierActionFailed(msg))
            }
        }
    }

    fn break_generation(&self, st: &mut BarrierState) {
        st.generation.broken.store(true, Ordering::Release);
        st.waiting = 0;
        self.state.notify_all();
    }

    /// Break the current generation, failing its waiters with
    /// `BrokenBarrier`, and start a fresh one.
    pub fn reset(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.check_reentry("reset")?;
        while st.is_tripping() {
            st = self.state.park(st);
        }
        tracing::debug!(
            generation = st.generation.id,
            waiting = st.waiting,
            "barrier reset"
        );
        self.break_generation(&mut st);
        st.next_generation();
        Ok(())
    }

    /// Number of parties required to trip the barrier.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of parties currently waiting in this generation.
    pub fn number_waiting(&self) -> usize {
        self.state.read(|st| st.waiting)
    }

    pub fn is_broken(&self) -> bool {
        self.state.read(|st| st.generation.is_broken())
    }
}

impl std::fmt::Debug for CyclicBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (waiting, broken) = self
            .state
            .read(|st| (st.waiting, st.generation.is_broken()));
        f.debug_struct("CyclicBarrier")
            .field("parties", &self.parties)
            .field("waiting", &waiting)
            .field("broken", &broken)
            .finish()
    }
}
