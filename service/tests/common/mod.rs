//! Shared fixtures: a scripted backend and a gateway wired to a manual clock.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use imagegate_service::clock::{Clock, ManualClock};
use imagegate_service::config::GatewayConfig;
use imagegate_service::middleware::ratelimit::RateLimitConfig;
use imagegate_service::orchestrator::{OrchestratorConfig, RequestOrchestrator};
use imagegate_service::providers::config::PresetConfig;
use imagegate_service::providers::{
    BackendAdapter, BackendAdapterDyn, BackendFailure, BackendOutcome, BackendPayload, BackendTarget,
    FailureSignal, GenerationPayload, RetryConfig,
};
use imagegate_service::request::{AdmissionScope, GenerationRequest};

/// What the backend does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Ok,
    Status(u16, &'static str),
    Connect,
    /// Sleep (on the tokio clock) before answering Ok.
    Hang(Duration),
}

/// Backend whose answers are scripted per key.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    default: Step,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::answering(Step::Ok)
    }

    /// Backend that answers `step` once a key's script runs out.
    pub fn answering(default: Step) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue answers for calls made with `key`.
    pub fn script(self, key: &str, steps: &[Step]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(steps.iter().cloned());
        self
    }

    /// Keys used, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, target: &BackendTarget) -> Step {
        let key = target.secret.expose().to_string();
        self.calls.lock().unwrap().push(key.clone());
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }
}

async fn play(step: Step) -> Result<(), BackendFailure> {
    match step {
        Step::Ok => Ok(()),
        Step::Status(code, body) => Err(BackendFailure::status(code, body)),
        Step::Connect => Err(BackendFailure::new(FailureSignal::Connect, "connection reset")),
        Step::Hang(wait) => {
            tokio::time::sleep(wait).await;
            Ok(())
        }
    }
}

impl BackendAdapter for ScriptedBackend {
    async fn invoke(
        &self,
        target: &BackendTarget,
        payload: &GenerationPayload,
        _budget: Duration,
    ) -> BackendOutcome {
        let step = self.next(target);
        play(step).await?;
        Ok(BackendPayload {
            model: target.model.clone(),
            body: serde_json::json!({ "image": "aGVsbG8=", "prompt": payload.prompt }),
        })
    }

    async fn list_models(
        &self,
        target: &BackendTarget,
        _budget: Duration,
    ) -> Result<Vec<String>, BackendFailure> {
        let step = self.next(target);
        play(step).await?;
        Ok(vec![target.model.clone(), "imagen-3".to_string()])
    }
}

/// Fast backoff, rate limiting off, quotas at their defaults.
pub fn gateway(presets: Vec<PresetConfig>) -> GatewayConfig {
    GatewayConfig {
        presets,
        rate_limit: RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
        orchestrator: OrchestratorConfig {
            backoff: RetryConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                multiplier: 2.0,
            },
            ..OrchestratorConfig::default()
        },
        ..GatewayConfig::default()
    }
}

pub fn build(
    config: &GatewayConfig,
    backend: &Arc<ScriptedBackend>,
) -> (RequestOrchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let orchestrator = RequestOrchestrator::from_config(
        config,
        Arc::clone(backend) as Arc<dyn BackendAdapterDyn>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .expect("valid presets");
    (orchestrator, clock)
}

pub fn request(user: &str) -> GenerationRequest {
    GenerationRequest::new("a lighthouse at dusk", AdmissionScope::user(user))
}
