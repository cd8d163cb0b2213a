use serde::{Deserialize, Serialize};

/// Bounded exponential backoff policy.
///
/// Delay computation is pure so schedules stay deterministic in tests; the
/// pipeline decides when (and whether) to actually sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay to wait before retry number `attempt` (1-based); `None` once the
    /// attempt cap is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<u64> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = u64::from(self.multiplier).saturating_pow(attempt.saturating_sub(1));
        Some(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Starts a fresh schedule governed by this policy.
    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule {
            policy: *self,
            attempts_made: 0,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            multiplier: 2,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

/// Mutable retry state for one failing operation.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    policy: BackoffPolicy,
    attempts_made: u32,
}

impl RetrySchedule {
    /// Records a failure and returns the delay before the next attempt, or
    /// `None` when the policy is exhausted.
    pub fn next_delay_ms(&mut self) -> Option<u64> {
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.policy.delay_for(self.attempts_made)
    }

    /// Failures recorded so far.
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn exhausted(&self) -> bool {
        self.attempts_made >= self.policy.max_attempts
    }
}
