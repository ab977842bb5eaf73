//! Bounded retry for transient backpressure
//!
//! Spins with `crossbeam::utils::Backoff` first, then sleeps according to
//! the configured policy once the spinner is exhausted.

use crossbeam::utils::Backoff;
use qnic_common::{BackoffKind, DatapathResult, RetryPolicy};
use std::time::Duration;

/// Outcome of a retried operation
#[derive(Debug)]
pub struct Retried<T> {
    /// Final outcome
    pub result: DatapathResult<T>,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Retry state for one operation
pub struct Retry<'a> {
    policy: &'a RetryPolicy,
    spinner: Backoff,
    attempt: u32,
}

impl<'a> Retry<'a> {
    /// Fresh retry state for `policy`
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy, spinner: Backoff::new(), attempt: 0 }
    }

    /// Delay before attempt `attempt + 1`
    pub fn delay(&self) -> Duration {
        let base = self.policy.base_delay_us;
        let us = match self.policy.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => base.saturating_mul(1u64 << self.attempt.min(16)),
        };
        Duration::from_micros(us.min(self.policy.max_delay_us))
    }

    /// Wait before the next attempt; false once the budget is spent
    pub fn wait(&mut self) -> bool {
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts.max(1) {
            return false;
        }
        if self.spinner.is_completed() {
            let delay = self.delay();
            if delay.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(delay);
            }
        } else {
            self.spinner.snooze();
        }
        true
    }

    /// Waits taken so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Run `op` until it succeeds, fails permanently or the budget runs out
pub fn retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> DatapathResult<T>) -> Retried<T> {
    let mut state = Retry::new(policy);
    loop {
        match op() {
            Err(e) if e.is_transient() => {
                if !state.wait() {
                    return Retried { result: Err(e), attempts: state.attempts() };
                }
            }
            result => return Retried { result, attempts: state.attempts() + 1 },
        }
    }
}
