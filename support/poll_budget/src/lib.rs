// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded spin-and-sleep polling.
//!
//! Useful for waiting on a condition (such as a device register changing
//! state) that can only be polled and has no interrupt-based notification.
//! Unlike an open-ended backoff, a [`PollBudget`] gives up after a fixed
//! number of checks, so the longest possible wait is known up front:
//! `iterations * interval`.

#![forbid(unsafe_code)]

use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// A fixed polling allowance: check a condition up to `iterations` times,
/// sleeping `interval` after every failed check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PollBudget {
    /// The maximum number of times the condition is checked.
    pub iterations: u32,
    /// How long to sleep after each failed check.
    pub interval: Duration,
}

/// The condition was not observed within the budget.
#[derive(Debug, Error)]
#[error("condition not observed after {iterations} polls ({waited:?})")]
pub struct PollTimeout {
    /// The number of checks performed. Always equal to the budget's
    /// iteration count.
    pub iterations: u32,
    /// Wall-clock time spent polling.
    pub waited: Duration,
}

impl PollBudget {
    /// Returns a new budget.
    pub const fn new(iterations: u32, interval: Duration) -> Self {
        Self {
            iterations,
            interval,
        }
    }

    /// A budget that checks the condition exactly once and never sleeps.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// The longest time [`Self::watch`] may sleep before giving up.
    pub fn max_wait(&self) -> Duration {
        self.interval.saturating_mul(self.iterations)
    }

    /// Polls `cond` until it returns true or the budget is exhausted.
    ///
    /// On success, returns the number of checks it took (at least 1). A
    /// budget of zero iterations never checks the condition and times out
    /// immediately.
    pub fn watch(&self, mut cond: impl FnMut() -> bool) -> Result<u32, PollTimeout> {
        let start = Instant::now();
        for i in 0..self.iterations {
            if cond() {
                return Ok(i + 1);
            }
            if !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
        }
        Err(PollTimeout {
            iterations: self.iterations,
            waited: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PollBudget;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn succeeds_on_first_true() {
        let n = Cell::new(0);
        let budget = PollBudget::new(10, Duration::ZERO);
        let polls = budget
            .watch(|| {
                n.set(n.get() + 1);
                n.get() == 3
            })
            .unwrap();
        assert_eq!(polls, 3);
        assert_eq!(n.get(), 3);
    }

    #[test]
    fn times_out_after_exact_budget() {
        let n = Cell::new(0u32);
        let budget = PollBudget::new(7, Duration::ZERO);
        let err = budget
            .watch(|| {
                n.set(n.get() + 1);
                false
            })
            .unwrap_err();
        assert_eq!(err.iterations, 7);
        assert_eq!(n.get(), 7);
    }

    #[test]
    fn zero_budget_never_checks() {
        let budget = PollBudget::new(0, Duration::from_secs(10));
        let err = budget.watch(|| panic!("should not be polled")).unwrap_err();
        assert_eq!(err.iterations, 0);
    }

    #[test]
    fn wait_is_bounded_by_iterations_times_interval() {
        let budget = PollBudget::new(4, Duration::from_millis(5));
        assert_eq!(budget.max_wait(), Duration::from_millis(20));
        let err = budget.watch(|| false).unwrap_err();
        assert!(err.waited >= Duration::from_millis(20));
    }
}
