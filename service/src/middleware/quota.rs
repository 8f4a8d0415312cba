//! Daily quota ledgers for users and groups.
//!
//! One mutex guards every entry so a request can be charged against several
//! ledgers at once: either all of them are decremented or none is.  Entries
//! roll over lazily when their stored day differs from the clock's.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub user_enabled: bool,
    /// Generations per user per day.
    pub user_limit: u32,
    pub group_enabled: bool,
    /// Generations per group per day.
    pub group_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            user_enabled: true,
            user_limit: 20,
            group_enabled: false,
            group_limit: 100,
        }
    }
}

/// The entity a ledger entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum QuotaScope {
    User(String),
    Group(String),
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    day: NaiveDate,
    consumed: u32,
    /// Extra allowance granted (or, if negative, withheld) for the day.
    granted: i64,
}

impl Entry {
    fn remaining(&self, limit: u32) -> u32 {
        let left = i64::from(limit) + self.granted - i64::from(self.consumed);
        left.clamp(0, i64::from(u32::MAX)) as u32
    }
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<QuotaScope, Entry>,
    limits: HashMap<QuotaScope, u32>,
}

/// Per-day usage counters.
pub struct QuotaLedger {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl QuotaLedger {
    pub fn new(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn default_limit(&self, scope: &QuotaScope) -> u32 {
        match scope {
            QuotaScope::User(_) => self.config.user_limit,
            QuotaScope::Group(_) => self.config.group_limit,
        }
    }

    /// Charge one unit against every scope, or against none.
    ///
    /// Returns the first scope without remaining capacity.
    pub fn charge_all(&self, scopes: &[QuotaScope]) -> Result<(), QuotaScope> {
        let today = self.clock.today();
        let mut state = self.lock();
        for scope in scopes {
            let limit = state.limit_for(scope, self.default_limit(scope));
            if state.entry(scope, today).remaining(limit) == 0 {
                return Err(scope.clone());
            }
        }
        for scope in scopes {
            state.entry(scope, today).consumed += 1;
        }
        Ok(())
    }

    /// Undo a charge made today.  A charge from a previous day is gone with
    /// that day's counters.
    pub fn refund(&self, scopes: &[QuotaScope], day: NaiveDate) {
        let today = self.clock.today();
        if day != today {
            return;
        }
        let mut state = self.lock();
        for scope in scopes {
            let entry = state.entry(scope, today);
            entry.consumed = entry.consumed.saturating_sub(1);
        }
    }

    /// Units left today for `scope`.
    pub fn remaining(&self, scope: &QuotaScope) -> u32 {
        let today = self.clock.today();
        let mut state = self.lock();
        let limit = state.limit_for(scope, self.default_limit(scope));
        state.entry(scope, today).remaining(limit)
    }

    /// Units consumed today by `scope`.
    pub fn consumed(&self, scope: &QuotaScope) -> u32 {
        let today = self.clock.today();
        self.lock().entry(scope, today).consumed
    }

    /// Override the daily limit of one scope.  Persists across days.
    pub fn set_limit(&self, scope: QuotaScope, limit: u32) {
        tracing::info!(scope = %scope, limit, "quota limit set");
        self.lock().limits.insert(scope, limit);
    }

    /// Grant (positive) or withhold (negative) units for today.
    /// Returns the new remaining count.
    pub fn adjust(&self, scope: &QuotaScope, delta: i64) -> u32 {
        let today = self.clock.today();
        let mut state = self.lock();
        let limit = state.limit_for(scope, self.default_limit(scope));
        let entry = state.entry(scope, today);
        entry.granted = entry.granted.saturating_add(delta);
        let remaining = entry.remaining(limit);
        tracing::info!(scope = %scope, delta, remaining, "quota adjusted");
        remaining
    }
}

impl LedgerState {
    fn limit_for(&self, scope: &QuotaScope, default: u32) -> u32 {
        self.limits.get(scope).copied().unwrap_or(default)
    }

    fn entry(&mut self, scope: &QuotaScope, today: NaiveDate) -> &mut Entry {
        let entry = self.entries.entry(scope.clone()).or_insert(Entry {
            day: today,
            consumed: 0,
            granted: 0,
        });
        if entry.day != today {
            *entry = Entry {
                day: today,
                consumed: 0,
                granted: 0,
            };
        }
        entry
    }
}
