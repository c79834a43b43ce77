//! Per-circuit turn taking for event dispatch and propagation.
//!
//! Only one call chain at a time may deliver events, set outputs or
//! evaluate formulas. Other threads wait for the chain to finish. Calls made
//! from inside the running chain pass straight through, so the re-entrancy
//! and dependency loop checks only ever see their own chain.
//!
//! Dispatch is synchronous, so a chain never spans an `.await` and the
//! current thread identifies it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct TurnState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A re-entrant lock owned by the running call chain.
#[derive(Default)]
pub(crate) struct TurnLock {
    state: Mutex<TurnState>,
    released: Condvar,
}

impl TurnLock {
    fn state(&self) -> MutexGuard<'_, TurnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the turn, or joins it when this thread already holds it.
    pub(crate) fn enter(&self) -> Turn<'_> {
        let me = thread::current().id();
        let mut state = self.state();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        Turn { lock: self }
    }
}

/// Holds the turn until dropped.
pub(crate) struct Turn<'a> {
    lock: &'a TurnLock,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state();
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.lock.released.notify_one();
        }
    }
}
