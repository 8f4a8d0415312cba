//! Credential selection and outcome reporting.
//!
//! Selection order for a preset:
//! 1. closed credentials, round-robin from the preset's cursor;
//! 2. otherwise the open credential whose cooldown expired most recently,
//!    moved to half-open as the single probe;
//! 3. otherwise fail fast with [`AcquireError::NoUsableCredential`].
//!
//! Every [`CredentialLease`] reports exactly once.  Dropping an unreported
//! lease (cancelled future, elapsed deadline) reports a timeout, so a probe
//! slot can never leak.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;
use crate::middleware::breaker::{BreakerConfig, BreakerState};
use crate::middleware::store::{CredentialId, CredentialStore, PresetHandle, PresetState};
use crate::providers::{BackendAdapterDyn, BackendTarget, FailureClass, classify};

/// Timeout applied to credential health checks.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("preset not found: {0}")]
    PresetNotFound(String),
    #[error("no usable credential in preset {preset}")]
    NoUsableCredential {
        preset: String,
        /// Shortest remaining cooldown, if any credential is cooling down.
        retry_in: Option<Duration>,
    },
}

/// Classified result of using a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureClass),
}

/// Operator-facing view of one credential's health.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub id: CredentialId,
    pub masked: String,
    pub fingerprint: String,
    pub state: BreakerState,
    #[serde(serialize_with = "crate::config::secs::serialize_opt")]
    pub retry_in: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_failure: Option<FailureClass>,
    pub likely_invalid: bool,
    pub probe_in_flight: bool,
}

/// Result of an explicit credential health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CredentialCheck {
    Healthy { models: usize },
    Failed { class: FailureClass },
    CoolingDown {
        #[serde(serialize_with = "crate::config::secs::serialize")]
        retry_in: Duration,
    },
    ProbeInFlight,
}

/// Selects credentials and feeds outcomes into their breakers.
#[derive(Clone)]
pub struct KeyPool {
    store: Arc<CredentialStore>,
    config: Arc<BreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    pub fn new(store: Arc<CredentialStore>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config: Arc::new(config),
            clock,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Check out a credential for `preset`.  Never waits for a cooldown.
    pub fn acquire(&self, preset: &str) -> Result<CredentialLease, AcquireError> {
        let handle = self
            .store
            .handle(preset)
            .ok_or_else(|| AcquireError::PresetNotFound(preset.to_string()))?;
        let now = self.clock.now();
        let mut state = handle.lock();
        let count = state.credentials.len();

        for offset in 0..count {
            let index = (state.cursor + offset) % count;
            if state.credentials[index].breaker.is_closed() {
                state.cursor = (index + 1) % count;
                let target = target_for(&state, index);
                drop(state);
                return Ok(self.lease(handle, target, false));
            }
        }

        let probe = state
            .credentials
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.breaker.probe_ready(now).map(|expired| (i, expired)))
            .max_by_key(|(_, expired)| *expired)
            .map(|(i, _)| i);

        if let Some(index) = probe {
            state.credentials[index].breaker.begin_probe();
            let target = target_for(&state, index);
            drop(state);
            tracing::info!(
                preset = %preset,
                credential = %target.credential,
                "credential half-open, probing"
            );
            return Ok(self.lease(handle, target, true));
        }

        let retry_in = state
            .credentials
            .iter()
            .filter_map(|c| c.breaker.retry_in(now))
            .min();
        Err(AcquireError::NoUsableCredential {
            preset: preset.to_string(),
            retry_in,
        })
    }

    fn lease(&self, handle: Arc<PresetHandle>, target: BackendTarget, probe: bool) -> CredentialLease {
        CredentialLease {
            handle,
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            target,
            probe,
            reported: false,
        }
    }

    /// Health of every credential in `preset`, in rotation order.
    pub fn status(&self, preset: &str) -> Result<Vec<CredentialStatus>, AcquireError> {
        let handle = self
            .store
            .handle(preset)
            .ok_or_else(|| AcquireError::PresetNotFound(preset.to_string()))?;
        let now = self.clock.now();
        let state = handle.lock();
        Ok(state
            .credentials
            .iter()
            .map(|c| CredentialStatus {
                id: c.id,
                masked: c.secret.masked(),
                fingerprint: c.secret.fingerprint(),
                state: c.breaker.state(),
                retry_in: c.breaker.retry_in(now),
                consecutive_failures: c.breaker.consecutive_failures(),
                last_failure: c.breaker.last_failure().map(|(_, class)| class),
                likely_invalid: c.breaker.likely_invalid(),
                probe_in_flight: c.breaker.probe_in_flight(),
            })
            .collect())
    }

    /// Probe one credential by listing models through `adapter`.
    ///
    /// Credentials still cooling down are not contacted.
    pub async fn check(
        &self,
        preset: &str,
        credential: CredentialId,
        adapter: &dyn BackendAdapterDyn,
    ) -> Result<CredentialCheck, AcquireError> {
        let lease = match self.lease_specific(preset, credential)? {
            Ok(lease) => lease,
            Err(check) => return Ok(check),
        };

        let result = tokio::time::timeout(
            CHECK_TIMEOUT,
            adapter.list_models_dyn(lease.target(), CHECK_TIMEOUT),
        )
        .await;

        let check = match result {
            Ok(Ok(models)) => {
                lease.report(Outcome::Success);
                CredentialCheck::Healthy {
                    models: models.len(),
                }
            }
            Ok(Err(failure)) => {
                let class = classify(&failure);
                lease.report(Outcome::Failure(class));
                CredentialCheck::Failed { class }
            }
            Err(_) => {
                lease.report(Outcome::Failure(FailureClass::Timeout));
                CredentialCheck::Failed {
                    class: FailureClass::Timeout,
                }
            }
        };
        Ok(check)
    }

    fn lease_specific(
        &self,
        preset: &str,
        credential: CredentialId,
    ) -> Result<Result<CredentialLease, CredentialCheck>, AcquireError> {
        let handle = self
            .store
            .handle(preset)
            .ok_or_else(|| AcquireError::PresetNotFound(preset.to_string()))?;
        let now = self.clock.now();
        let mut state = handle.lock();
        let index = state
            .credentials
            .iter()
            .position(|c| c.id == credential)
            .ok_or_else(|| AcquireError::NoUsableCredential {
                preset: preset.to_string(),
                retry_in: None,
            })?;

        let breaker = &mut state.credentials[index].breaker;
        let probe = if breaker.is_closed() {
            false
        } else if breaker.probe_ready(now).is_some() {
            breaker.begin_probe();
            true
        } else if let Some(retry_in) = breaker.retry_in(now) {
            return Ok(Err(CredentialCheck::CoolingDown { retry_in }));
        } else {
            return Ok(Err(CredentialCheck::ProbeInFlight));
        };

        let target = target_for(&state, index);
        drop(state);
        Ok(Ok(self.lease(handle, target, probe)))
    }
}

fn target_for(state: &PresetState, index: usize) -> BackendTarget {
    let slot = &state.credentials[index];
    BackendTarget {
        kind: state.meta.kind,
        preset: state.meta.name.clone(),
        endpoint: state.meta.endpoint.clone(),
        model: state.meta.model.clone(),
        credential: slot.id,
        secret: slot.secret.clone(),
    }
}

/// A checked-out credential.  Report its outcome with [`CredentialLease::report`].
pub struct CredentialLease {
    handle: Arc<PresetHandle>,
    config: Arc<BreakerConfig>,
    clock: Arc<dyn Clock>,
    target: BackendTarget,
    probe: bool,
    reported: bool,
}

impl CredentialLease {
    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn credential(&self) -> CredentialId {
        self.target.credential
    }

    /// Whether this lease holds the half-open probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record the outcome and release the lease.
    pub fn report(mut self, outcome: Outcome) {
        self.apply(outcome);
    }

    fn apply(&mut self, outcome: Outcome) {
        if self.reported {
            return;
        }
        self.reported = true;

        let now: Instant = self.clock.now();
        let mut state = self.handle.lock();
        // The credential may have been removed while we held it.
        let Some(slot) = state.slot_mut(self.target.credential) else {
            return;
        };
        match outcome {
            Outcome::Success => slot.breaker.record_success(self.probe),
            Outcome::Failure(class) => {
                slot.breaker.record_failure(class, now, &self.config, self.probe);
                if slot.breaker.state() == BreakerState::Open {
                    tracing::warn!(
                        preset = %self.target.preset,
                        credential = %self.target.credential,
                        fingerprint = %self.target.secret.fingerprint(),
                        class = class.as_str(),
                        cooldown_secs = slot.breaker.retry_in(now).unwrap_or_default().as_secs(),
                        likely_invalid = slot.breaker.likely_invalid(),
                        "credential cooling down"
                    );
                }
            }
        }
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        // If not explicitly reported, record as a timeout
        if !self.reported {
            tracing::debug!(
                preset = %self.target.preset,
                credential = %self.target.credential,
                "lease dropped without report, recording timeout"
            );
            self.apply(Outcome::Failure(FailureClass::Timeout));
        }
    }
}

impl std::fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLease")
            .field("target", &self.target)
            .field("probe", &self.probe)
            .field("reported", &self.reported)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::providers::config::PresetConfig;

    fn pool(keys: &[&str]) -> (KeyPool, Arc<ManualClock>) {
        let store = CredentialStore::new();
        store
            .add_preset(PresetConfig::google("p", "gemini", keys))
            .unwrap();
        let clock = Arc::new(ManualClock::default());
        let pool = KeyPool::new(Arc::new(store), BreakerConfig::default(), clock.clone());
        (pool, clock)
    }

    #[test]
    fn round_robin_over_closed_credentials() {
        let (pool, _) = pool(&["a", "b", "c"]);
        let picks: Vec<String> = (0..4)
            .map(|_| {
                let lease = pool.acquire("p").unwrap();
                let key = lease.target().secret.expose().to_string();
                lease.report(Outcome::Success);
                key
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn open_credentials_are_skipped() {
        let (pool, _) = pool(&["a", "b"]);
        let lease = pool.acquire("p").unwrap();
        lease.report(Outcome::Failure(FailureClass::RateLimited));

        for _ in 0..3 {
            let lease = pool.acquire("p").unwrap();
            assert_eq!(lease.target().secret.expose(), "b");
            lease.report(Outcome::Success);
        }
    }

    #[test]
    fn no_usable_credential_reports_shortest_cooldown() {
        let (pool, _) = pool(&["a"]);
        pool.acquire("p")
            .unwrap()
            .report(Outcome::Failure(FailureClass::RateLimited));
        let err = pool.acquire("p").unwrap_err();
        assert_eq!(
            err,
            AcquireError::NoUsableCredential {
                preset: "p".to_string(),
                retry_in: Some(Duration::from_secs(30)),
            }
        );
    }

    #[test]
    fn empty_preset_has_no_usable_credential() {
        let (pool, _) = pool(&[]);
        assert!(matches!(
            pool.acquire("p"),
            Err(AcquireError::NoUsableCredential { retry_in: None, .. })
        ));
        assert!(matches!(
            pool.acquire("missing"),
            Err(AcquireError::PresetNotFound(_))
        ));
    }

    #[test]
    fn expired_cooldown_yields_single_probe() {
        let (pool, clock) = pool(&["a"]);
        pool.acquire("p")
            .unwrap()
            .report(Outcome::Failure(FailureClass::RateLimited));
        clock.advance(Duration::from_secs(30));

        let probe = pool.acquire("p").unwrap();
        assert!(probe.is_probe());
        assert!(pool.acquire("p").is_err());

        probe.report(Outcome::Success);
        let lease = pool.acquire("p").unwrap();
        assert!(!lease.is_probe());
    }

    #[test]
    fn most_recently_expired_credential_is_probed() {
        let (pool, clock) = pool(&["a", "b"]);
        pool.acquire("p")
            .unwrap()
            .report(Outcome::Failure(FailureClass::RateLimited));
        clock.advance(Duration::from_secs(10));
        pool.acquire("p")
            .unwrap()
            .report(Outcome::Failure(FailureClass::RateLimited));
        clock.advance(Duration::from_secs(60));

        let probe = pool.acquire("p").unwrap();
        assert_eq!(probe.target().secret.expose(), "b");
    }

    #[test]
    fn dropped_lease_reports_timeout() {
        let (pool, _) = pool(&["a"]);
        for _ in 0..3 {
            drop(pool.acquire("p").unwrap());
        }
        let status = pool.status("p").unwrap();
        assert_eq!(status[0].state, BreakerState::Open);
        assert_eq!(status[0].last_failure, Some(FailureClass::Timeout));
    }

    #[test]
    fn dropped_probe_releases_slot_and_reopens() {
        let (pool, clock) = pool(&["a"]);
        pool.acquire("p")
            .unwrap()
            .report(Outcome::Failure(FailureClass::QuotaExhausted));
        clock.advance(Duration::from_secs(5 * 3600));

        drop(pool.acquire("p").unwrap());
        let status = pool.status("p").unwrap();
        assert_eq!(status[0].state, BreakerState::Open);
        assert!(!status[0].probe_in_flight);
        assert!(status[0].retry_in.unwrap() >= Duration::from_secs(5 * 3600));
    }

    #[test]
    fn report_after_credential_removed_is_ignored() {
        let (pool, _) = pool(&["a", "b"]);
        let lease = pool.acquire("p").unwrap();
        pool.store().remove_credential("p", lease.credential()).unwrap();
        lease.report(Outcome::Failure(FailureClass::AuthFailure));
        let status = pool.status("p").unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, BreakerState::Closed);
    }
}
