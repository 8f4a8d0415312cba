//! Retry state machine with exponential backoff.
//!
//! The orchestrator drives one [`RetryState`] per request.  The state holds
//! the attempt counter and the absolute deadline; it decides what happens
//! after each failure but never sleeps or calls a backend itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::secs;
use crate::providers::{Disposition, FailureClass};

/// Backoff between retryable attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial backoff duration
    #[serde(with = "secs")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "secs")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Why the loop ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    AttemptsExhausted,
    DeadlineExceeded,
    /// The last failure must not be retried.
    NonRetryable,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Wait, then try another credential.
    Backoff(Duration),
    /// Try another credential right away.
    Immediate,
    Stop(StopReason),
}

#[derive(Debug, Clone)]
pub struct RetryState {
    config: RetryConfig,
    max_attempts: u32,
    deadline: Instant,
    attempts: u32,
    backoff: Duration,
}

impl RetryState {
    pub fn new(config: RetryConfig, max_attempts: u32, deadline: Instant) -> Self {
        let backoff = config.initial_backoff;
        Self {
            config,
            max_attempts: max_attempts.max(1),
            deadline,
            attempts: 0,
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time left before the deadline.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Whether another attempt may start at `now`.
    pub fn check(&self, now: Instant) -> Result<(), StopReason> {
        if self.remaining(now).is_zero() {
            return Err(StopReason::DeadlineExceeded);
        }
        if self.attempts >= self.max_attempts {
            return Err(StopReason::AttemptsExhausted);
        }
        Ok(())
    }

    /// Count an attempt already cleared by [`RetryState::check`].  Returns
    /// its 1-based number.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Record a failed attempt and decide the next step.
    pub fn on_failure(&mut self, class: FailureClass, now: Instant) -> RetryStep {
        let disposition = class.disposition();
        if disposition == Disposition::Stop {
            return RetryStep::Stop(StopReason::NonRetryable);
        }
        if self.attempts >= self.max_attempts {
            return RetryStep::Stop(StopReason::AttemptsExhausted);
        }
        let remaining = self.remaining(now);
        if remaining.is_zero() {
            return RetryStep::Stop(StopReason::DeadlineExceeded);
        }
        match disposition {
            Disposition::NextCredential => RetryStep::Immediate,
            _ => {
                let wait = self.backoff.min(remaining);
                // Exponential backoff with cap
                self.backoff = Duration::try_from_secs_f64(
                    (self.backoff.as_secs_f64() * self.config.multiplier)
                        .min(self.config.max_backoff.as_secs_f64()),
                )
                .unwrap_or(self.config.max_backoff);
                RetryStep::Backoff(wait)
            }
        }
    }
}
