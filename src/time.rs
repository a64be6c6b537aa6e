//! Bounded polling helper
//!
//! The controller has no timer of its own, so waits are bounded by a number
//! of polling iterations rather than wall-clock time.

use core::cell::Cell;

/// Iteration budget for a busy-wait loop
pub struct Timeout {
    remaining: Cell<u32>,
    unbounded: bool,
}

impl Timeout {
    /// Budget of `limit` polls, or no limit at all for `None`
    pub fn from_limit(limit: Option<u32>) -> Self {
        Self {
            remaining: Cell::new(limit.unwrap_or(0)),
            unbounded: limit.is_none(),
        }
    }

    /// Consume one poll; returns true once the budget is spent
    pub fn is_expired(&self) -> bool {
        if self.unbounded {
            return false;
        }
        let left = self.remaining.get();
        if left == 0 {
            return true;
        }
        self.remaining.set(left - 1);
        false
    }
}
