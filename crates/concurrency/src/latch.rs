//! Retry latch
//!
//! A latch is the wakeup handle of a blocked transaction. It is registered
//! on every reference the transaction read and opened by the first commit
//! that changes one of them.
//!
//! Latches are reused across attempts. Each reset starts a new era; an
//! `open(era)` for an older era is ignored, so a late commit notifying a
//! listener from a previous attempt cannot wake the current one.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct LatchState {
    era: u64,
    open: bool,
}

/// Blocking wakeup handle with eras
#[derive(Debug)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    /// Create a closed latch in era 0
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState {
                era: 0,
                open: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Current era
    pub fn era(&self) -> u64 {
        self.state.lock().era
    }

    /// True if the latch is open in its current era
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Open the latch if it is still in `era`, waking all waiters
    pub fn open(&self, era: u64) {
        let mut state = self.state.lock();
        if state.era != era || state.open {
            return;
        }
        state.open = true;
        self.cond.notify_all();
    }

    /// Close the latch and start a new era; returns the new era
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.era += 1;
        state.open = false;
        // Waiters of the old era must not sleep forever
        self.cond.notify_all();
        state.era
    }

    /// Block until the latch is opened or its era moves past `era`
    pub fn await_open(&self, era: u64) {
        let mut state = self.state.lock();
        while state.era == era && !state.open {
            self.cond.wait(&mut state);
        }
    }

    /// Block for at most `timeout_ns` nanoseconds
    ///
    /// Returns the remaining budget (`>= 0`) if the latch opened in time,
    /// or a negative value if the timeout elapsed first.
    pub fn try_await_nanos(&self, era: u64, timeout_ns: i64) -> i64 {
        if timeout_ns <= 0 {
            return if self.is_open_in(era) { 0 } else { -1 };
        }

        let start = Instant::now();
        let deadline = start + Duration::from_nanos(timeout_ns as u64);
        let mut state = self.state.lock();
        loop {
            if state.era != era || state.open {
                let elapsed = i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX);
                return timeout_ns.saturating_sub(elapsed).max(0);
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.era != era || state.open {
                    return 0;
                }
                return -1;
            }
        }
    }

    /// True once opening the latch in `era` would no longer wake anyone
    pub fn is_open_in(&self, era: u64) -> bool {
        let state = self.state.lock();
        state.era != era || state.open
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
