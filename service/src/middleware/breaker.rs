//! Per-credential circuit breaker.
//!
//! ```text
//! Closed   -> Open      rate limit, quota, auth, or N consecutive transient failures
//! Open     -> HalfOpen  cooldown elapsed and the key pool hands out a probe
//! HalfOpen -> Closed    probe succeeded
//! HalfOpen -> Open      probe failed; cooldown grows, never shrinks
//! ```
//!
//! There is no terminal state.  The "likely invalid" flag raised by auth
//! failures is informational and does not stop future probes.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::secs;
use crate::providers::FailureClass;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Cooldown schedule for one failure class: `base * multiplier^step`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CooldownPolicy {
    #[serde(with = "secs")]
    pub base: Duration,
    pub multiplier: f64,
    #[serde(with = "secs")]
    pub cap: Duration,
}

impl CooldownPolicy {
    pub const fn new(base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            base,
            multiplier,
            cap,
        }
    }

    /// Cooldown for the `step`-th escalation (0 = first).
    pub fn cooldown(&self, step: u32) -> Duration {
        let exp = step.min(63) as i32;
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// Breaker tuning shared by every credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive transient failures before the breaker opens.
    pub failure_threshold: u32,
    /// Factor applied to the previous cooldown when a half-open probe fails.
    pub probe_backoff: f64,
    pub rate_limit: CooldownPolicy,
    pub transient: CooldownPolicy,
    pub quota: CooldownPolicy,
    pub auth: CooldownPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_backoff: 2.0,
            rate_limit: CooldownPolicy::new(
                Duration::from_secs(30),
                2.0,
                Duration::from_secs(300),
            ),
            transient: CooldownPolicy::new(
                Duration::from_secs(60),
                2.0,
                Duration::from_secs(600),
            ),
            quota: CooldownPolicy::new(
                Duration::from_secs(5 * 3600),
                2.0,
                Duration::from_secs(24 * 3600),
            ),
            auth: CooldownPolicy::new(
                Duration::from_secs(24 * 3600),
                2.0,
                Duration::from_secs(7 * 24 * 3600),
            ),
        }
    }
}

impl BreakerConfig {
    fn policy(&self, class: FailureClass) -> &CooldownPolicy {
        match class {
            FailureClass::RateLimited => &self.rate_limit,
            FailureClass::QuotaExhausted => &self.quota,
            FailureClass::AuthFailure => &self.auth,
            FailureClass::Transient | FailureClass::Timeout | FailureClass::Unclassified => {
                &self.transient
            }
        }
    }
}

/// Health of a single credential.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_class: Option<FailureClass>,
    cooldown_until: Option<Instant>,
    last_cooldown: Duration,
    probe_in_flight: bool,
    likely_invalid: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_class: None,
            cooldown_until: None,
            last_cooldown: Duration::ZERO,
            probe_in_flight: false,
            likely_invalid: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == BreakerState::Closed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<(Instant, FailureClass)> {
        self.last_failure.zip(self.last_class)
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    pub fn probe_in_flight(&self) -> bool {
        self.probe_in_flight
    }

    pub fn likely_invalid(&self) -> bool {
        self.likely_invalid
    }

    /// If a probe may start now, the instant its cooldown expired.
    ///
    /// A half-open breaker whose probe is still out is not eligible.
    pub fn probe_ready(&self, now: Instant) -> Option<Instant> {
        match self.state {
            BreakerState::Closed => None,
            BreakerState::HalfOpen if self.probe_in_flight => None,
            BreakerState::HalfOpen => Some(self.cooldown_until.unwrap_or(now)),
            BreakerState::Open => self.cooldown_until.filter(|until| *until <= now),
        }
    }

    /// Time left until an open breaker may be probed.
    pub fn retry_in(&self, now: Instant) -> Option<Duration> {
        match self.state {
            BreakerState::Open => self
                .cooldown_until
                .map(|until| until.saturating_duration_since(now)),
            _ => None,
        }
    }

    /// Hand out the single half-open probe slot.
    pub fn begin_probe(&mut self) {
        self.state = BreakerState::HalfOpen;
        self.probe_in_flight = true;
    }

    /// Record a successful call. `probe` is true only for the lease that
    /// holds the half-open slot.
    pub fn record_success(&mut self, probe: bool) {
        self.consecutive_failures = 0;
        if self.state == BreakerState::HalfOpen && !probe {
            // A lease taken before the breaker opened; the probe decides.
            return;
        }
        self.probe_in_flight = false;
        if self.state == BreakerState::Open {
            // A late success from a call that started before the breaker
            // opened; the cooldown still stands.
            return;
        }
        self.state = BreakerState::Closed;
        self.cooldown_until = None;
        self.last_cooldown = Duration::ZERO;
        self.likely_invalid = false;
    }

    /// Record a failed call. Only the probe lease (`probe == true`) may move a
    /// half-open breaker; other reports during that window update counters.
    pub fn record_failure(
        &mut self,
        class: FailureClass,
        now: Instant,
        config: &BreakerConfig,
        probe: bool,
    ) {
        let was_probe = probe && self.state == BreakerState::HalfOpen;
        let stale = !probe && self.state == BreakerState::HalfOpen;
        if !stale {
            self.probe_in_flight = false;
        }
        self.last_failure = Some(now);
        self.last_class = Some(class);

        let policy = config.policy(class);
        let cooldown = match class {
            FailureClass::RateLimited => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                Some(policy.cooldown(self.consecutive_failures - 1))
            }
            FailureClass::QuotaExhausted => Some(policy.cooldown(0)),
            FailureClass::AuthFailure => {
                self.likely_invalid = true;
                Some(policy.cooldown(0))
            }
            FailureClass::Transient | FailureClass::Timeout | FailureClass::Unclassified => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let threshold = config.failure_threshold.max(1);
                (self.consecutive_failures >= threshold)
                    .then(|| policy.cooldown(self.consecutive_failures - threshold))
            }
        };

        if stale {
            return;
        }

        let cooldown = if was_probe {
            let grown = Duration::try_from_secs_f64(
                self.last_cooldown.as_secs_f64() * config.probe_backoff.max(1.0),
            )
            .unwrap_or(policy.cap);
            let floor = cooldown.unwrap_or(policy.base);
            Some(
                grown
                    .max(floor)
                    .min(policy.cap.max(self.last_cooldown))
                    .max(self.last_cooldown),
            )
        } else {
            cooldown
        };

        if let Some(cooldown) = cooldown {
            self.open(now, cooldown);
        }
    }

    fn open(&mut self, now: Instant, cooldown: Duration) {
        let until = now.checked_add(cooldown).unwrap_or(now);
        // An already-open breaker keeps the later of the two deadlines.
        if self.state == BreakerState::Open
            && let Some(existing) = self.cooldown_until
            && existing >= until
        {
            return;
        }
        self.state = BreakerState::Open;
        self.cooldown_until = Some(until);
        self.last_cooldown = self.last_cooldown.max(cooldown);
    }
}
