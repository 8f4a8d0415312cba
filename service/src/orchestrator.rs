//! Request orchestration: admission, key selection, invocation, retry and
//! preset failover, bounded by one deadline.
//!
//! ```text
//! admit ──reject──────────────────────────────────────────────▶ Err
//!   │
//! resolve preset ──▶ acquire ──none──▶ fallback? ──no──────────▶ Err
//!                      │  ▲               └─yes─▶ acquire (once)
//!                   invoke│
//!                      │  └──retry / next credential
//!                   success ──────────────────────────────────▶ Ok
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::{GatewayConfig, secs};
use crate::error::{ErrorKind, GenerationError};
use crate::middleware::admission::AdmissionGate;
use crate::middleware::keypool::{AcquireError, KeyPool, Outcome};
use crate::middleware::metrics::{ExecutionReport, ExecutionStats};
use crate::middleware::route::{PresetRouter, RouteError, RoutePlan};
use crate::middleware::store::{CredentialId, CredentialStore, StoreError};
use crate::providers::{
    BackendAdapterDyn, FailureClass, RetryConfig, RetryState, RetryStep, StopReason, classify,
};
use crate::request::{GenerationOutput, GenerationRequest, GenerationResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Deadline for a request that does not carry its own timeout.
    #[serde(with = "secs")]
    pub default_timeout: Duration,
    /// Backend calls per request, across presets.
    pub max_attempts: u32,
    /// Preset tried once after the primary has no usable credential left.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_preset: Option<String>,
    pub backoff: RetryConfig,
    /// Give back the admission charge when a request ends in a backend failure.
    pub refund_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_attempts: 5,
            fallback_preset: None,
            backoff: RetryConfig::default(),
            refund_on_failure: true,
        }
    }
}

/// Where the last attempt ran, for error context.
#[derive(Debug, Clone)]
struct LastAttempt {
    class: FailureClass,
    message: String,
    credential: CredentialId,
    fingerprint: String,
}

/// Sequences one request through admission and the backends.
pub struct RequestOrchestrator {
    config: OrchestratorConfig,
    gate: Arc<AdmissionGate>,
    pool: KeyPool,
    router: PresetRouter,
    backend: Arc<dyn BackendAdapterDyn>,
    stats: Arc<ExecutionStats>,
}

impl RequestOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        gate: Arc<AdmissionGate>,
        pool: KeyPool,
        backend: Arc<dyn BackendAdapterDyn>,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        let router = PresetRouter::new(Arc::clone(pool.store()), config.fallback_preset.clone());
        Self {
            config,
            gate,
            pool,
            router,
            backend,
            stats,
        }
    }

    /// Wire up every component from a [`GatewayConfig`].
    pub fn from_config(
        config: &GatewayConfig,
        backend: Arc<dyn BackendAdapterDyn>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let store = CredentialStore::from_presets(config.presets.iter().cloned())?;
        if let Some(current) = &config.current_preset {
            store.set_current(current)?;
        }
        let gate = AdmissionGate::new(
            config.policy.clone(),
            config.rate_limit.clone(),
            config.quota.clone(),
            Arc::clone(&clock),
        );
        let pool = KeyPool::new(Arc::new(store), config.breaker.clone(), Arc::clone(&clock));
        let stats = ExecutionStats::new(clock);
        Ok(Self::new(
            config.orchestrator.clone(),
            Arc::new(gate),
            pool,
            backend,
            Arc::new(stats),
        ))
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.pool.store()
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn stats(&self) -> &Arc<ExecutionStats> {
        &self.stats
    }

    /// Run one request to a terminal result.
    pub async fn execute(&self, request: &GenerationRequest) -> GenerationResult {
        let started = Instant::now();
        let result = self.run(request, started).await;

        let report = match &result {
            Ok(output) => ExecutionReport {
                preset: Some(output.preset.clone()),
                credential: Some(output.credential),
                fingerprint: Some(output.fingerprint.clone()),
                attempts: output.attempts,
                outcome: Ok(()),
                latency: started.elapsed(),
                user_id: request.scope.user_id.clone(),
                group_id: request.scope.group_id.clone(),
            },
            Err(err) => ExecutionReport {
                preset: err.preset.clone(),
                credential: err.credential,
                fingerprint: err.fingerprint.clone(),
                attempts: err.attempts,
                outcome: Err(err.kind),
                latency: started.elapsed(),
                user_id: request.scope.user_id.clone(),
                group_id: request.scope.group_id.clone(),
            },
        };
        self.stats.record(&report);
        result
    }

    async fn run(&self, request: &GenerationRequest, started: Instant) -> GenerationResult {
        let ticket = self.gate.try_admit(&request.scope).map_err(|rejection| {
            tracing::info!(
                user = %request.scope.user_id,
                group = ?request.scope.group_id,
                reason = %rejection,
                "request rejected at admission"
            );
            GenerationError::from(rejection)
        })?;

        let plan = match self.router.plan(request.preset.as_deref()) {
            Ok(plan) => plan,
            Err(e) => {
                self.gate.refund(ticket);
                let err = GenerationError::new(ErrorKind::PresetNotFound, e.to_string());
                return Err(match e {
                    RouteError::PresetNotFound(name) => err.with_preset(name),
                    RouteError::NoCurrentPreset => err,
                });
            }
        };

        let timeout = request
            .overrides
            .timeout
            .unwrap_or(self.config.default_timeout);
        let result = self.attempt_loop(request, &plan, started, timeout).await;

        if let Err(err) = &result
            && self.config.refund_on_failure
        {
            tracing::debug!(kind = %err.kind, "refunding admission charge");
            self.gate.refund(ticket);
        }
        result
    }

    async fn attempt_loop(
        &self,
        request: &GenerationRequest,
        plan: &RoutePlan,
        started: Instant,
        timeout: Duration,
    ) -> GenerationResult {
        let deadline = started + timeout;
        let payload = request.payload();
        let mut retry = RetryState::new(
            self.config.backoff.clone(),
            self.config.max_attempts,
            deadline,
        );
        let mut preset = plan.primary.clone();
        let mut last: Option<LastAttempt> = None;

        loop {
            let now = Instant::now();
            if let Err(stop) = retry.check(now) {
                return Err(stopped(stop, &retry, &preset, last.as_ref()));
            }

            let lease = match self.pool.acquire(&preset) {
                Ok(lease) => lease,
                Err(AcquireError::NoUsableCredential { retry_in, .. }) => {
                    if let Some(next) = plan.next_target(&preset) {
                        tracing::warn!(
                            from = %preset,
                            to = %next,
                            "no usable credential, switching to fallback preset"
                        );
                        preset = next.to_string();
                        continue;
                    }
                    return Err(match last.as_ref() {
                        Some(attempt) => terminal(attempt, &preset, retry.attempts()),
                        None => GenerationError::new(
                            ErrorKind::NoUsableCredential,
                            match retry_in {
                                Some(wait) => format!(
                                    "all credentials in preset {preset} are cooling down, retry in {}s",
                                    wait.as_secs().max(1)
                                ),
                                None => format!("preset {preset} has no usable credential"),
                            },
                        )
                        .with_preset(preset.clone())
                        .with_attempts(retry.attempts()),
                    });
                }
                Err(AcquireError::PresetNotFound(name)) => {
                    return Err(GenerationError::new(
                        ErrorKind::PresetNotFound,
                        format!("preset {name} was removed"),
                    )
                    .with_preset(name)
                    .with_attempts(retry.attempts()));
                }
            };

            let attempt = retry.record_attempt();
            let budget = retry.remaining(now);
            let credential = lease.credential();
            let fingerprint = lease.target().secret.fingerprint();

            let call = self.backend.invoke_dyn(lease.target(), &payload, budget);
            let result = tokio::time::timeout(budget, call).await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    lease.report(Outcome::Failure(FailureClass::Timeout));
                    tracing::warn!(
                        preset = %preset,
                        credential = %credential,
                        attempt,
                        "deadline elapsed during backend call"
                    );
                    return Err(GenerationError::new(
                        ErrorKind::DeadlineExceeded,
                        format!("request deadline of {:.1}s elapsed", timeout.as_secs_f64()),
                    )
                    .with_preset(preset.clone())
                    .with_credential(credential, fingerprint)
                    .with_attempts(attempt));
                }
            };

            match outcome {
                Ok(payload) => {
                    lease.report(Outcome::Success);
                    tracing::info!(
                        preset = %preset,
                        credential = %credential,
                        attempt,
                        "generation succeeded"
                    );
                    return Ok(GenerationOutput {
                        payload,
                        preset,
                        credential,
                        fingerprint,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(failure) => {
                    let class = classify(&failure);
                    lease.report(Outcome::Failure(class));
                    tracing::warn!(
                        preset = %preset,
                        credential = %credential,
                        fingerprint = %fingerprint,
                        attempt,
                        class = class.as_str(),
                        error = %failure,
                        "backend attempt failed"
                    );
                    let record = LastAttempt {
                        class,
                        message: failure.message,
                        credential,
                        fingerprint,
                    };
                    let step = retry.on_failure(class, Instant::now());
                    last = Some(record);
                    match step {
                        RetryStep::Backoff(wait) => tokio::time::sleep(wait).await,
                        RetryStep::Immediate => {}
                        RetryStep::Stop(stop) => {
                            return Err(stopped(stop, &retry, &preset, last.as_ref()));
                        }
                    }
                }
            }
        }
    }
}

/// Terminal error carrying the last attempt's classification.
fn terminal(last: &LastAttempt, preset: &str, attempts: u32) -> GenerationError {
    GenerationError::new(ErrorKind::from(last.class), last.message.clone())
        .with_preset(preset)
        .with_credential(last.credential, last.fingerprint.clone())
        .with_attempts(attempts)
}

fn stopped(
    stop: StopReason,
    retry: &RetryState,
    preset: &str,
    last: Option<&LastAttempt>,
) -> GenerationError {
    match (stop, last) {
        (StopReason::DeadlineExceeded, last) => {
            let mut err = GenerationError::new(
                ErrorKind::DeadlineExceeded,
                match last {
                    Some(attempt) => format!(
                        "deadline elapsed after {} attempts, last failure: {}",
                        retry.attempts(),
                        attempt.message
                    ),
                    None => "deadline elapsed before any attempt".to_string(),
                },
            )
            .with_preset(preset)
            .with_attempts(retry.attempts());
            if let Some(attempt) = last {
                err = err.with_credential(attempt.credential, attempt.fingerprint.clone());
            }
            err
        }
        (_, Some(attempt)) => terminal(attempt, preset, retry.attempts()),
        (_, None) => GenerationError::new(ErrorKind::NoUsableCredential, "no attempt was made")
            .with_preset(preset)
            .with_attempts(retry.attempts()),
    }
}
