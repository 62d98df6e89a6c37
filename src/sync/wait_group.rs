//! Wait group: block until a counter drains to zero
//!
//! Count and waiter tally share one 64-bit atomic word (count in the high
//! half, signed; waiters in the low half), so `add` observes both halves
//! in a single load-linked step and the zero transition cannot race a late
//! waiter registering.

use crate::sync::Semaphore;
use std::sync::atomic::{AtomicU64, Ordering};

fn unpack(state: u64) -> (i32, u32) {
    ((state >> 32) as i32, state as u32)
}

/// Counter that tasks can block on until it reaches zero.
///
/// `add` with a positive delta registers pending work; `add(-1)` retires
/// it; `wait` suspends the calling task until the count drains. The count
/// going negative, or new work being added while the count is zero and
/// waiters are blocked, is a fatal error.
pub struct WaitGroup {
    state: AtomicU64,
    sema: Semaphore,
}

impl WaitGroup {
    /// Create a wait group with a zero count.
    pub const fn new() -> Self {
        WaitGroup {
            state: AtomicU64::new(0),
            sema: Semaphore::new(0),
        }
    }

    /// Adjust the count by `delta`. When the count reaches zero, every
    /// blocked waiter is released.
    pub fn add(&self, delta: i32) {
        let shifted = (delta as i64 as u64) << 32;
        let state = self
            .state
            .fetch_add(shifted, Ordering::SeqCst)
            .wrapping_add(shifted);
        let (count, waiters) = unpack(state);

        assert!(count >= 0, "wait group count went negative");
        assert!(
            waiters == 0 || delta <= 0 || count != delta,
            "wait group reused: add raced a blocked wait on the zero transition"
        );

        if count == 0 && waiters > 0 {
            // Between our fetch_add and here no add may run (count is
            // zero) and no waiter may register (waiters only CAS in while
            // the count is positive), so the word must be untouched.
            assert!(
                self.state.load(Ordering::SeqCst) == state,
                "wait group mutated during the zero transition"
            );
            self.state.store(0, Ordering::SeqCst);
            for _ in 0..waiters {
                self.sema.release();
            }
        }
    }

    /// Block the current task until the count reaches zero. Returns
    /// immediately if it already is. Fatal if the calling thread is not
    /// attached to a scheduler and the count is non-zero.
    pub fn wait(&self) {
        let mut state = self.state.load(Ordering::SeqCst);
        loop {
            let (count, _) = unpack(state);
            if count == 0 {
                return;
            }

            // Register as a waiter, then block on the semaphore.
            match self.state.compare_exchange_weak(
                state,
                state + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.sema.acquire();
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}
