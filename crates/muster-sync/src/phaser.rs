// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Phaser: a reusable barrier whose party count changes at runtime.
//!
//! Parties register and deregister while phases run. The phase number only
//! grows; the arrival that completes a phase evaluates the advance predicate,
//! which either opens the next phase or terminates the phaser for good.
//!
//! A registration joins the phase in progress, raising its arrival target;
//! growing the target never releases anyone early. Only while a boundary is
//! being processed (the predicate is running) are registrations held as
//! pending; they are applied under the same lock that performs the advance.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Result, SyncError};
use crate::monitor::{Monitor, Wait};

type OnAdvance = Box<dyn Fn(u64, usize) -> bool + Send + Sync>;

struct PhaserState {
    phase: u64,
    /// Arrival target of the current phase.
    registered: usize,
    /// Registrations waiting for the next boundary.
    pending: usize,
    arrived: usize,
    terminated: bool,
    /// Thread running the advance predicate with the lock released.
    advancing: Option<ThreadId>,
}

impl PhaserState {
    fn is_advancing(&self) -> bool {
        self.advancing.is_some()
    }

    fn snapshot(&self) -> PhaserSnapshot {
        PhaserSnapshot {
            phase: self.phase,
            registered: self.registered,
            arrived: self.arrived,
            unarrived: self.registered - self.arrived,
            pending: self.pending,
            terminated: self.terminated,
        }
    }
}

/// Consistent view of all phaser counters, read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaserSnapshot {
    pub phase: u64,
    pub registered: usize,
    pub arrived: usize,
    pub unarrived: usize,
    pub pending: usize,
    pub terminated: bool,
}

/// Outcome of an arrival; `Terminated` carries the final phase.
enum Arrival {
    Counted(u64),
    Terminated(u64),
}

pub struct Phaser {
    on_advance: OnAdvance,
    state: Arc<Monitor<PhaserState>>,
}

impl Phaser {
    /// Create a phaser with `parties` registered for phase 0. It terminates
    /// once an advance finds no parties left.
    pub fn new(parties: usize) -> Self {
        Self::with_on_advance(parties, |_, registered| registered == 0)
    }

    /// Create a phaser whose termination is decided by `on_advance`.
    ///
    /// `on_advance(phase, registered)` runs on the arrival that completes
    /// `phase`; `registered` is the party count of the phase that would come
    /// next. Returning `true` terminates the phaser. The predicate may read the
    /// phaser's counters and register parties, which join the next phase
    /// unless the phaser terminates. Arriving from inside it fails with
    /// `SyncError::IllegalState`.
    pub fn with_on_advance<F>(parties: usize, on_advance: F) -> Self
    where
        F: Fn(u64, usize) -> bool + Send + Sync + 'static,
    {
        Self {
            on_advance: Box::new(on_advance),
            state: Arc::new(Monitor::new(PhaserState {
                phase: 0,
                registered: parties,
                pending: 0,
                arrived: 0,
                terminated: false,
                advancing: None,
            })),
        }
    }

    /// Add one party. See `bulk_register`.
    pub fn register(&self) -> Result<u64> {
        self.bulk_register(1)
    }

    /// Add `parties` parties at once.
    ///
    /// Returns the phase in which the new parties first take part: the
    /// current phase, or the next one when the current phase is completing
    /// right now.
    pub fn bulk_register(&self, parties: usize) -> Result<u64> {
        let mut st = self.state.lock();
        if st.terminated {
            return Err(SyncError::illegal("register on a terminated phaser"));
        }
        if parties == 0 {
            return Ok(st.phase);
        }
        let total = st
            .registered
            .checked_add(st.pending)
            .and_then(|n| n.checked_add(parties));
        if total.is_none() {
            return Err(SyncError::illegal("phaser party count overflow"));
        }

        if st.is_advancing() {
            st.pending += parties;
            tracing::trace!(phase = st.phase, parties, "phaser registration pending");
            Ok(st.phase + 1)
        } else {
            st.registered += parties;
            tracing::trace!(phase = st.phase, parties, "phaser registration");
            Ok(st.phase)
        }
    }

    /// Arrive without waiting. Returns the phase arrived at.
    pub fn arrive(&self) -> Result<u64> {
        match self.arrive_inner(false)? {
            Arrival::Counted(phase) => Ok(phase),
            Arrival::Terminated(_) => Err(SyncError::illegal("arrive on a terminated phaser")),
        }
    }

    /// Arrive and leave: the party no longer counts from the next phase on.
    /// Returns the phase arrived at.
    pub fn arrive_and_deregister(&self) -> Result<u64> {
        match self.arrive_inner(true)? {
            Arrival::Counted(phase) => Ok(phase),
            Arrival::Terminated(_) => Err(SyncError::illegal(
                "arrive_and_deregister on a terminated phaser",
            )),
        }
    }

    /// Arrive and block until the phase advances.
    ///
    /// Returns the new phase, or the final phase once the phaser has
    /// terminated. A terminated phaser returns immediately.
    pub fn arrive_and_await_advance(&self) -> Result<u64> {
        match self.arrive_inner(false)? {
            Arrival::Counted(phase) => self.await_with(phase, Wait::forever()),
            Arrival::Terminated(phase) => Ok(phase),
        }
    }

    fn arrive_inner(&self, deregister: bool) -> Result<Arrival> {
        let mut st = self.state.lock();
        if st.advancing == Some(thread::current().id()) {
            return Err(SyncError::illegal("arrival from inside the advance predicate"));
        }
        while st.is_advancing() {
            st = self.state.park(st);
        }
        if st.terminated {
            return Ok(Arrival::Terminated(st.phase));
        }
        if st.arrived >= st.registered {
            return Err(SyncError::illegal(format!(
                "arrival exceeds registered parties in phase {} ({} of {} arrived)",
                st.phase, st.arrived, st.registered
            )));
        }

        let phase = st.phase;
        if deregister {
            st.registered -= 1;
        } else {
            st.arrived += 1;
        }
        tracing::trace!(
            phase,
            arrived = st.arrived,
            registered = st.registered,
            deregister,
            "phaser arrival"
        );
        if st.arrived == st.registered {
            self.advance(st);
        }
        Ok(Arrival::Counted(phase))
    }

    /// Runs on the arrival that completed the current phase.
    fn advance<'a>(&'a self, mut st: MutexGuard<'a, PhaserState>) {
        let phase = st.phase;
        let parties = st.registered + st.pending;
        st.advancing = Some(thread::current().id());
        drop(st);

        let verdict = panic::catch_unwind(AssertUnwindSafe(|| (self.on_advance)(phase, parties)));

        let mut st = self.state.lock();
        st.advancing = None;
        let terminate = *verdict.as_ref().unwrap_or(&true);
        if terminate || st.terminated {
            st.terminated = true;
            st.pending = 0;
            tracing::debug!(phase, registered = st.registered, "phaser terminated");
        } else {
            let pending = std::mem::take(&mut st.pending);
            st.registered += pending;
            st.arrived = 0;
            st.phase += 1;
            tracing::debug!(
                phase = st.phase,
                registered = st.registered,
                joined = pending,
                "phaser advanced"
            );
        }
        self.state.notify_all();
        drop(st);

        if let Err(payload) = verdict {
            tracing::warn!(phase, "phaser advance predicate panicked");
            panic::resume_unwind(payload);
        }
    }

    /// Block until the phase moves past `phase` or the phaser terminates.
    /// Returns at once if that has already happened. Returns the current
    /// phase.
    pub fn await_advance(&self, phase: u64) -> u64 {
        match self.await_with(phase, Wait::forever()) {
            Ok(current) => current,
            // An unbounded wait is never aborted.
            Err(_) => self.phase(),
        }
    }

    /// Like `await_advance`, giving up with `SyncError::TimedOut`.
    /// Giving up leaves the phaser untouched.
    pub fn await_advance_timeout(&self, phase: u64, timeout: Duration) -> Result<u64> {
        self.await_with(phase, Wait::timeout(timeout))
    }

    /// Like `await_advance`, giving up with `SyncError::Interrupted` when
    /// `token` fires. Giving up leaves the phaser untouched.
    pub fn await_advance_cancellable(&self, phase: u64, token: &CancelToken) -> Result<u64> {
        self.await_with(phase, Wait::cancellable(token))
    }

    fn await_with(&self, phase: u64, wait: Wait<'_>) -> Result<u64> {
        let mut st = self.state.lock();
        if st.phase != phase || st.terminated {
            return Ok(st.phase);
        }
        wait.begin(&self.state);
        loop {
            if st.phase != phase || st.terminated {
                return Ok(st.phase);
            }
            let (guard, abort) = self.state.park_for(st, &wait);
            st = guard;
            if let Some(abort) = abort {
                tracing::trace!(phase, %abort, "phaser wait aborted");
                return Err(abort);
            }
        }
    }

    /// Terminate now, releasing every waiter. Idempotent.
    pub fn force_termination(&self) {
        let mut st = self.state.lock();
        if st.terminated {
            return;
        }
        st.terminated = true;
        st.pending = 0;
        tracing::debug!(phase = st.phase, "phaser force-terminated");
        self.state.notify_all();
    }

    pub fn phase(&self) -> u64 {
        self.state.read(|st| st.phase)
    }

    pub fn registered_parties(&self) -> usize {
        self.state.read(|st| st.registered)
    }

    pub fn arrived_parties(&self) -> usize {
        self.state.read(|st| st.arrived)
    }

    pub fn unarrived_parties(&self) -> usize {
        self.state.read(|st| st.registered - st.arrived)
    }

    /// Parties registered mid-phase that join at the next boundary.
    pub fn pending_parties(&self) -> usize {
        self.state.read(|st| st.pending)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.read(|st| st.terminated)
    }

    pub fn snapshot(&self) -> PhaserSnapshot {
        self.state.read(PhaserState::snapshot)
    }
}

impl Default for Phaser {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for Phaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("Phaser")
            .field("phase", &snap.phase)
            .field("registered", &snap.registered)
            .field("arrived", &snap.arrived)
            .field("pending", &snap.pending)
            .field("terminated", &snap.terminated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn wait_for_arrived(phaser: &Phaser, n: usize) {
        while phaser.arrived_parties() < n {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn fresh_counters() {
        let phaser = Phaser::new(3);
        assert_eq!(
            phaser.snapshot(),
            PhaserSnapshot {
                phase: 0,
                registered: 3,
                arrived: 0,
                unarrived: 3,
                pending: 0,
                terminated: false,
            }
        );
    }

    #[test]
    fn arrivals_complete_phase() {
        let phaser = Phaser::new(3);
        assert_eq!(phaser.arrive(), Ok(0));
        assert_eq!(phaser.arrive(), Ok(0));
        assert_eq!(phaser.unarrived_parties(), 1);
        assert_eq!(phaser.arrive(), Ok(0));
        assert_eq!(phaser.phase(), 1);
        assert_eq!(phaser.arrived_parties(), 0);
        assert_eq!(phaser.registered_parties(), 3);
    }

    #[test]
    fn bulk_register_before_arrivals_joins_current_phase() {
        let phaser = Phaser::new(1);
        assert_eq!(phaser.bulk_register(3), Ok(0));
        assert_eq!(phaser.registered_parties(), 4);
        assert_eq!(phaser.bulk_register(0), Ok(0));
        assert_eq!(phaser.registered_parties(), 4);
    }

    #[test]
    fn register_after_arrival_raises_target() {
        let phaser = Phaser::new(2);
        phaser.arrive().unwrap();
        assert_eq!(phaser.register(), Ok(0));
        assert_eq!(phaser.registered_parties(), 3);
        assert_eq!(phaser.pending_parties(), 0);

        phaser.arrive().unwrap();
        assert_eq!(phaser.phase(), 0);
        phaser.arrive().unwrap();
        assert_eq!(phaser.phase(), 1);
        assert_eq!(phaser.registered_parties(), 3);
    }

    #[test]
    fn entry_gate_waits_for_coordinator() {
        let phaser = Arc::new(Phaser::new(1));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                assert_eq!(phaser.register(), Ok(0));
                let p = phaser.clone();
                let h = thread::spawn(move || p.arrive_and_await_advance());
                thread::sleep(Duration::from_millis(20));
                h
            })
            .collect();
        wait_for_arrived(&phaser, 3);
        assert_eq!(phaser.phase(), 0);
        assert_eq!(phaser.registered_parties(), 4);

        assert_eq!(phaser.arrive_and_deregister(), Ok(0));
        for h in workers {
            assert_eq!(h.join().unwrap(), Ok(1));
        }
        assert_eq!(phaser.registered_parties(), 3);
    }

    /// Registers one party from inside the predicate and reports what the
    /// registration saw: (returned phase, pending while advancing).
    fn register_during_advance(terminate: bool) -> (Arc<Phaser>, (u64, usize)) {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        let phaser = Arc::new_cyclic(|weak: &std::sync::Weak<Phaser>| {
            let weak = weak.clone();
            Phaser::with_on_advance(1, move |_, _| {
                let p = weak.upgrade().unwrap();
                let joined = p.register().unwrap();
                *s.lock().unwrap() = Some((joined, p.pending_parties()));
                terminate
            })
        });
        phaser.arrive().unwrap();
        let seen = seen.lock().unwrap().take().unwrap();
        (phaser, seen)
    }

    #[test]
    fn register_during_advance_joins_next_phase() {
        let (phaser, (joined, pending)) = register_during_advance(false);
        assert_eq!((joined, pending), (1, 1));
        assert_eq!(phaser.phase(), 1);
        assert_eq!(phaser.registered_parties(), 2);
        assert_eq!(phaser.pending_parties(), 0);
        assert_eq!(phaser.arrived_parties(), 0);
    }

    #[test]
    fn register_during_terminating_advance_is_dropped() {
        let (phaser, (joined, pending)) = register_during_advance(true);
        assert_eq!((joined, pending), (1, 1));
        assert!(phaser.is_terminated());
        assert_eq!(phaser.phase(), 0);
        assert_eq!(phaser.registered_parties(), 1);
        assert_eq!(phaser.pending_parties(), 0);
    }

    #[test]
    fn arrival_from_predicate_is_illegal() {
        let outcome = Arc::new(std::sync::Mutex::new(None));
        let o = outcome.clone();
        let phaser = Arc::new_cyclic(|weak: &std::sync::Weak<Phaser>| {
            let weak = weak.clone();
            Phaser::with_on_advance(1, move |_, _| {
                *o.lock().unwrap() = Some(weak.upgrade().unwrap().arrive());
                false
            })
        });
        phaser.arrive().unwrap();
        assert!(matches!(
            outcome.lock().unwrap().take(),
            Some(Err(SyncError::IllegalState(_)))
        ));
        assert_eq!(phaser.phase(), 1);
    }

    #[test]
    fn arrival_beyond_registered_is_illegal() {
        let phaser = Phaser::new(0);
        assert!(matches!(phaser.arrive(), Err(SyncError::IllegalState(_))));
        assert!(matches!(
            phaser.arrive_and_deregister(),
            Err(SyncError::IllegalState(_))
        ));
        assert_eq!(phaser.phase(), 0);
    }

    #[test]
    fn last_deregistration_terminates_by_default() {
        let phaser = Phaser::new(2);
        phaser.arrive_and_deregister().unwrap();
        assert!(!phaser.is_terminated());
        assert_eq!(phaser.registered_parties(), 1);
        phaser.arrive_and_deregister().unwrap();
        assert!(phaser.is_terminated());
        assert_eq!(phaser.registered_parties(), 0);
    }

    #[test]
    fn predicate_keeps_empty_phaser_alive() {
        let phaser = Phaser::with_on_advance(1, |_, _| false);
        phaser.arrive_and_deregister().unwrap();
        assert!(!phaser.is_terminated());
        assert_eq!(phaser.phase(), 1);
        assert_eq!(phaser.register(), Ok(1));
    }

    #[test]
    fn predicate_sees_next_party_count() {
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let s = seen.clone();
        let phaser = Phaser::with_on_advance(2, move |_, registered| {
            s.store(registered, Ordering::SeqCst);
            false
        });
        phaser.arrive().unwrap();
        phaser.bulk_register(2).unwrap();
        for _ in 0..3 {
            phaser.arrive().unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn terminated_phaser_behaviour() {
        let phaser = Phaser::with_on_advance(1, |_, _| true);
        assert_eq!(phaser.arrive_and_await_advance(), Ok(0));
        assert!(phaser.is_terminated());
        assert_eq!(phaser.arrive_and_await_advance(), Ok(0));
        assert!(matches!(phaser.arrive(), Err(SyncError::IllegalState(_))));
        assert!(matches!(phaser.register(), Err(SyncError::IllegalState(_))));
        assert_eq!(phaser.await_advance(0), 0);
    }

    #[test]
    fn trigger_does_not_block() {
        let phaser = Phaser::new(1);
        assert_eq!(phaser.arrive_and_await_advance(), Ok(1));
        assert_eq!(phaser.arrive_and_await_advance(), Ok(2));
    }

    #[test]
    fn waiters_released_on_advance() {
        let phaser = Arc::new(Phaser::new(4));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let p = phaser.clone();
                thread::spawn(move || p.arrive_and_await_advance())
            })
            .collect();
        wait_for_arrived(&phaser, 3);
        assert_eq!(phaser.phase(), 0);
        phaser.arrive().unwrap();
        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(1));
        }
    }

    #[test]
    fn predicate_can_read_counters() {
        let phaser = Arc::new_cyclic(|weak: &std::sync::Weak<Phaser>| {
            let weak = weak.clone();
            Phaser::with_on_advance(3, move |phase, _| {
                let p = weak.upgrade().unwrap();
                assert_eq!(p.phase(), phase);
                assert_eq!(p.unarrived_parties(), 0);
                true
            })
        });
        phaser.register().unwrap();
        phaser.arrive().unwrap();
        let waiter = {
            let p = phaser.clone();
            thread::spawn(move || p.arrive_and_await_advance())
        };
        wait_for_arrived(&phaser, 2);
        phaser.arrive().unwrap();
        phaser.arrive_and_deregister().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(0));
        assert!(phaser.is_terminated());
        assert_eq!(phaser.registered_parties(), 3);
    }

    #[test]
    fn await_other_phase_returns_at_once() {
        let phaser = Phaser::new(1);
        phaser.arrive().unwrap();
        assert_eq!(phaser.await_advance(0), 1);
    }

    #[test]
    fn await_timeout_leaves_state() {
        let phaser = Phaser::new(2);
        phaser.arrive().unwrap();
        assert_eq!(
            phaser.await_advance_timeout(0, Duration::from_millis(20)),
            Err(SyncError::TimedOut)
        );
        assert_eq!(phaser.arrived_parties(), 1);
        assert!(!phaser.is_terminated());
    }

    #[test]
    fn await_cancellable_interrupted() {
        let phaser = Arc::new(Phaser::new(2));
        let token = Arc::new(CancelToken::new());
        let h = {
            let (p, t) = (phaser.clone(), token.clone());
            thread::spawn(move || p.await_advance_cancellable(0, &t))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(h.join().unwrap(), Err(SyncError::Interrupted));
        assert_eq!(phaser.phase(), 0);
    }

    #[test]
    fn force_termination_releases_waiters() {
        let phaser = Arc::new(Phaser::new(2));
        let h = {
            let p = phaser.clone();
            thread::spawn(move || p.arrive_and_await_advance())
        };
        wait_for_arrived(&phaser, 1);
        phaser.force_termination();
        assert_eq!(h.join().unwrap(), Ok(0));
        assert!(phaser.is_terminated());
    }

    #[test]
    fn predicate_panic_terminates_and_propagates() {
        let phaser = Phaser::with_on_advance(1, |_, _| panic!("predicate boom"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| phaser.arrive()));
        assert!(result.is_err());
        assert!(phaser.is_terminated());
        assert_eq!(phaser.await_advance(0), 0);
    }

    #[test]
    fn debug_snapshot() {
        let phaser = Phaser::new(2);
        assert_eq!(
            format!("{:?}", phaser),
            "Phaser { phase: 0, registered: 2, arrived: 0, pending: 0, terminated: false }"
        );
    }
}
