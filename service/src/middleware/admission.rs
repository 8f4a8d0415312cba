//! Admission control: policy lists, then rate limit, then quota.
//!
//! A request that passes is charged immediately and gets an
//! [`AdmissionTicket`]; the ticket is what a later refund gives back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;
use crate::middleware::quota::{QuotaConfig, QuotaLedger, QuotaScope};
use crate::middleware::ratelimit::{RateLimitConfig, RateLimiter};
use crate::request::AdmissionScope;

/// Black- and whitelists.  Blacklists always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub user_blacklist: HashSet<String>,
    pub group_blacklist: HashSet<String>,
    /// When non-empty, only these users are admitted.
    pub user_whitelist: HashSet<String>,
    /// When non-empty, only these groups are admitted (applies to group
    /// requests only).
    pub group_whitelist: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("user {0} is blacklisted")]
    UserBlacklisted(String),
    #[error("group {0} is blacklisted")]
    GroupBlacklisted(String),
    #[error("user {0} is not whitelisted")]
    UserNotWhitelisted(String),
    #[error("group {0} is not whitelisted")]
    GroupNotWhitelisted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("rejected by policy: {0}")]
    Policy(PolicyViolation),
    #[error("rate limited")]
    RateLimited {
        /// Time until a token is available; `None` if the bucket never refills.
        retry_after: Option<Duration>,
    },
    #[error("daily quota exceeded for {scope}")]
    QuotaExceeded { scope: QuotaScope },
}

impl PolicyConfig {
    fn check(&self, scope: &AdmissionScope) -> Result<(), PolicyViolation> {
        if self.user_blacklist.contains(&scope.user_id) {
            return Err(PolicyViolation::UserBlacklisted(scope.user_id.clone()));
        }
        if let Some(group) = &scope.group_id
            && self.group_blacklist.contains(group)
        {
            return Err(PolicyViolation::GroupBlacklisted(group.clone()));
        }
        if !self.user_whitelist.is_empty() && !self.user_whitelist.contains(&scope.user_id) {
            return Err(PolicyViolation::UserNotWhitelisted(scope.user_id.clone()));
        }
        if let Some(group) = &scope.group_id
            && !self.group_whitelist.is_empty()
            && !self.group_whitelist.contains(group)
        {
            return Err(PolicyViolation::GroupNotWhitelisted(group.clone()));
        }
        Ok(())
    }
}

/// Proof of admission, and the record of what was charged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionTicket {
    bucket: Option<String>,
    charged: Vec<QuotaScope>,
    day: NaiveDate,
}

impl AdmissionTicket {
    /// Ticket for a privileged scope: nothing charged.
    fn free(day: NaiveDate) -> Self {
        Self {
            bucket: None,
            charged: Vec::new(),
            day,
        }
    }

    pub fn is_free(&self) -> bool {
        self.bucket.is_none() && self.charged.is_empty()
    }

    pub fn charged(&self) -> &[QuotaScope] {
        &self.charged
    }
}

/// Combined policy, rate-limit and quota gate.
pub struct AdmissionGate {
    policy: PolicyConfig,
    limiter: RateLimiter,
    ledger: QuotaLedger,
    clock: Arc<dyn Clock>,
}

impl AdmissionGate {
    pub fn new(
        policy: PolicyConfig,
        rate_limit: RateLimitConfig,
        quota: QuotaConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            limiter: RateLimiter::new(rate_limit, Arc::clone(&clock)),
            ledger: QuotaLedger::new(quota, Arc::clone(&clock)),
            clock,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Ledgers a request from `scope` is charged against.
    fn quota_scopes(&self, scope: &AdmissionScope) -> Vec<QuotaScope> {
        let config = self.ledger.config();
        let mut scopes = Vec::with_capacity(2);
        if config.user_enabled {
            scopes.push(QuotaScope::User(scope.user_id.clone()));
        }
        if config.group_enabled
            && let Some(group) = &scope.group_id
        {
            scopes.push(QuotaScope::Group(group.clone()));
        }
        scopes
    }

    pub fn try_admit(&self, scope: &AdmissionScope) -> Result<AdmissionTicket, Rejection> {
        let day = self.clock.today();
        if scope.privileged {
            return Ok(AdmissionTicket::free(day));
        }

        self.policy.check(scope).map_err(Rejection::Policy)?;

        let bucket = self.limiter.is_enabled().then(|| scope.bucket_key());
        if let Some(key) = &bucket {
            self.limiter
                .try_acquire(key)
                .map_err(|retry_after| Rejection::RateLimited { retry_after })?;
        }

        let charged = self.quota_scopes(scope);
        if let Err(exhausted) = self.ledger.charge_all(&charged) {
            if let Some(key) = &bucket {
                self.limiter.release(key);
            }
            return Err(Rejection::QuotaExceeded { scope: exhausted });
        }

        Ok(AdmissionTicket {
            bucket,
            charged,
            day,
        })
    }

    /// Give back what `ticket` charged.
    pub fn refund(&self, ticket: AdmissionTicket) {
        if ticket.is_free() {
            return;
        }
        if let Some(key) = &ticket.bucket {
            self.limiter.release(key);
        }
        self.ledger.refund(&ticket.charged, ticket.day);
        tracing::debug!(charged = ticket.charged.len(), "admission refunded");
    }
}
