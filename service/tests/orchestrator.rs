//! End-to-end tests for the request orchestrator against a scripted backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedBackend, Step, build, gateway, request};
use imagegate_service::error::ErrorKind;
use imagegate_service::middleware::breaker::BreakerState;
use imagegate_service::middleware::keypool::Outcome;
use imagegate_service::middleware::quota::QuotaScope;
use imagegate_service::providers::{FailureClass, RetryConfig};
use imagegate_service::providers::config::PresetConfig;
use imagegate_service::request::{AdmissionScope, GenerationRequest};
use tokio::time::Instant;

fn user(id: &str) -> QuotaScope {
    QuotaScope::User(id.to_string())
}

// ============================================================================
// Key rotation and breaker feedback
// ============================================================================

/// A 429 on the first key fails over to the second and cools the first down.
#[tokio::test(start_paused = true)]
async fn test_rate_limited_key_fails_over() {
    let backend = Arc::new(ScriptedBackend::new().script("key-a", &[Step::Status(429, "slow down")]));
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["key-a", "key-b"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let output = orchestrator.execute(&request("u1")).await.unwrap();
    assert_eq!(output.preset, "main");
    assert_eq!(output.attempts, 2);
    assert_eq!(backend.calls(), vec!["key-a", "key-b"]);

    let status = orchestrator.pool().status("main").unwrap();
    assert_eq!(output.credential, status[1].id);
    assert_eq!(status[0].state, BreakerState::Open);
    assert_eq!(status[0].retry_in, Some(Duration::from_secs(30)));
    assert_eq!(status[0].last_failure, Some(FailureClass::RateLimited));
    assert_eq!(status[1].state, BreakerState::Closed);
}

/// A 402 on the only key surfaces as quota exhaustion with a long cooldown.
#[tokio::test(start_paused = true)]
async fn test_payment_required_exhausts_single_key() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Status(402, "payment required")));
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["only"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendQuotaExhausted);
    assert_eq!(err.attempts, 1);
    assert_eq!(err.preset.as_deref(), Some("main"));

    let status = orchestrator.pool().status("main").unwrap();
    assert_eq!(err.credential, Some(status[0].id));
    assert_eq!(err.fingerprint.as_deref(), Some(status[0].fingerprint.as_str()));
    assert_eq!(status[0].retry_in, Some(Duration::from_secs(5 * 3600)));
    assert_eq!(backend.calls().len(), 1);
}

/// Auth failures move on immediately and flag the key.
#[tokio::test(start_paused = true)]
async fn test_auth_failure_marks_key_invalid() {
    let backend = Arc::new(ScriptedBackend::new().script("bad", &[Step::Status(401, "invalid key")]));
    let config = gateway(vec![PresetConfig::openai("main", None, "gpt-image-1", &["bad", "good"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let output = orchestrator.execute(&request("u1")).await.unwrap();
    assert_eq!(output.attempts, 2);

    let status = orchestrator.pool().status("main").unwrap();
    assert!(status[0].likely_invalid);
    assert_eq!(status[0].state, BreakerState::Open);
    assert!(!status[1].likely_invalid);
}

/// Every key rejected for auth ends in an auth failure, not a generic error.
#[tokio::test(start_paused = true)]
async fn test_all_keys_rejected() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Status(403, "forbidden")));
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["a", "b"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendAuthFailure);
    assert_eq!(err.attempts, 2);
}

/// Credentials already cooling down are never contacted.
#[tokio::test(start_paused = true)]
async fn test_cooling_preset_reports_no_usable_credential() {
    let backend = Arc::new(ScriptedBackend::new());
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["a"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let lease = orchestrator.pool().acquire("main").unwrap();
    lease.report(Outcome::Failure(FailureClass::RateLimited));

    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoUsableCredential);
    assert_eq!(err.attempts, 0);
    assert!(err.message.contains("retry in 30s"), "{}", err.message);
    assert!(backend.calls().is_empty());
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 0);
}

/// A preset with no keys at all.
#[tokio::test(start_paused = true)]
async fn test_empty_preset() {
    let backend = Arc::new(ScriptedBackend::new());
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &[])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoUsableCredential);
    assert!(backend.calls().is_empty());
}

// ============================================================================
// Retry budget
// ============================================================================

/// Transient failures stop at the attempt cap.
#[tokio::test(start_paused = true)]
async fn test_attempt_cap() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Status(503, "unavailable")));
    let mut config = gateway(vec![PresetConfig::google(
        "main",
        "gemini-image",
        &["k1", "k2", "k3", "k4", "k5"],
    )]);
    config.orchestrator.max_attempts = 3;
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendTransient);
    assert_eq!(err.attempts, 3);
    assert_eq!(backend.calls(), vec!["k1", "k2", "k3"]);
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 0);
}

/// Connection errors retry like server errors.
#[tokio::test(start_paused = true)]
async fn test_connect_error_is_retried() {
    let backend = Arc::new(ScriptedBackend::new().script("k1", &[Step::Connect]));
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["k1", "k2"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let output = orchestrator.execute(&request("u1")).await.unwrap();
    assert_eq!(output.attempts, 2);
}

/// A backend slower than the request deadline ends in DeadlineExceeded and
/// the key is charged with a timeout.
#[tokio::test(start_paused = true)]
async fn test_deadline_shorter_than_backend() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Hang(Duration::from_secs(10))));
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["slow"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let req = request("u1").with_timeout(Duration::from_secs(1));
    let err = orchestrator.execute(&req).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    assert_eq!(err.attempts, 1);

    let status = orchestrator.pool().status("main").unwrap();
    assert_eq!(status[0].last_failure, Some(FailureClass::Timeout));
    assert_eq!(status[0].consecutive_failures, 1);
    assert!(!status[0].probe_in_flight);
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 0);
}

/// A deadline that runs out while backing off ends the loop long before the
/// attempt cap, without overshooting the request timeout.
#[tokio::test(start_paused = true)]
async fn test_deadline_during_backoff() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Status(503, "unavailable")));
    let mut config = gateway(vec![PresetConfig::google(
        "main",
        "gemini-image",
        &["k1", "k2", "k3", "k4", "k5"],
    )]);
    config.orchestrator.max_attempts = 100;
    config.orchestrator.backoff = RetryConfig {
        initial_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(1),
        multiplier: 1.0,
    };
    let (orchestrator, _clock) = build(&config, &backend);

    let timeout = Duration::from_millis(2500);
    let started = Instant::now();
    let err = orchestrator
        .execute(&request("u1").with_timeout(timeout))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    assert_eq!(err.attempts, 3);
    assert!(err.attempts < 100);
    assert!(elapsed <= timeout, "took {elapsed:?}");
    assert_eq!(backend.calls(), vec!["k1", "k2", "k3"]);
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 0);
}

/// Unrecognised failures are not retried.
#[tokio::test(start_paused = true)]
async fn test_unclassified_failure_stops() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Status(400, "prompt rejected")));
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["k1", "k2"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendUnclassifiedFailure);
    assert_eq!(err.attempts, 1);
    assert_eq!(err.message, "prompt rejected");
}

// ============================================================================
// Routing
// ============================================================================

/// The fallback preset takes over once the primary has no usable key.
#[tokio::test(start_paused = true)]
async fn test_fallback_preset() {
    let backend = Arc::new(ScriptedBackend::new().script("main-key", &[Step::Status(429, "busy")]));
    let mut config = gateway(vec![
        PresetConfig::google("main", "gemini-image", &["main-key"]),
        PresetConfig::zai("backup", "cogview-4", &["backup-key"]),
    ]);
    config.orchestrator.fallback_preset = Some("backup".to_string());
    let (orchestrator, _clock) = build(&config, &backend);

    let output = orchestrator.execute(&request("u1")).await.unwrap();
    assert_eq!(output.preset, "backup");
    assert_eq!(output.attempts, 2);
    assert_eq!(output.payload.model, "cogview-4");
    assert_eq!(backend.calls(), vec!["main-key", "backup-key"]);
}

/// The fallback is tried once; when it fails too, its error is returned.
#[tokio::test(start_paused = true)]
async fn test_fallback_is_used_once() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Status(402, "no credits")));
    let mut config = gateway(vec![
        PresetConfig::google("main", "gemini-image", &["m"]),
        PresetConfig::google("backup", "gemini-image", &["b"]),
    ]);
    config.orchestrator.fallback_preset = Some("backup".to_string());
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::BackendQuotaExhausted);
    assert_eq!(err.preset.as_deref(), Some("backup"));
    assert_eq!(backend.calls(), vec!["m", "b"]);
}

/// An explicitly requested preset wins over the current one.
#[tokio::test(start_paused = true)]
async fn test_explicit_preset() {
    let backend = Arc::new(ScriptedBackend::new());
    let config = gateway(vec![
        PresetConfig::google("main", "gemini-image", &["m"]),
        PresetConfig::openai("other", None, "gpt-image-1", &["o"]),
    ]);
    let (orchestrator, _clock) = build(&config, &backend);

    let output = orchestrator
        .execute(&request("u1").with_preset("other"))
        .await
        .unwrap();
    assert_eq!(output.preset, "other");
    assert_eq!(backend.calls(), vec!["o"]);
}

/// Unknown presets are refused after admission and the charge is refunded.
#[tokio::test(start_paused = true)]
async fn test_unknown_preset_refunds() {
    let backend = Arc::new(ScriptedBackend::new());
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["m"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator
        .execute(&request("u1").with_preset("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PresetNotFound);
    assert_eq!(err.preset.as_deref(), Some("missing"));
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 0);
    assert!(backend.calls().is_empty());
}

// ============================================================================
// Admission through the orchestrator
// ============================================================================

/// The bucket holds three tokens and never refills.
#[tokio::test(start_paused = true)]
async fn test_rate_limit_bucket_of_three() {
    let backend = Arc::new(ScriptedBackend::new());
    let mut config = gateway(vec![PresetConfig::google("main", "gemini-image", &["m"])]);
    config.rate_limit.enabled = true;
    config.rate_limit.capacity = 3;
    config.rate_limit.window = Duration::ZERO;
    let (orchestrator, _clock) = build(&config, &backend);

    for _ in 0..3 {
        orchestrator.execute(&request("u1")).await.unwrap();
    }
    let err = orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimited);
    assert_eq!(err.attempts, 0);
    assert_eq!(backend.calls().len(), 3);
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 3);
}

/// Successful requests keep their charge; failed ones give it back.
#[tokio::test(start_paused = true)]
async fn test_charge_kept_only_on_success() {
    let backend = Arc::new(
        ScriptedBackend::new().script("m", &[Step::Ok, Step::Status(400, "bad")]),
    );
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["m"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    orchestrator.execute(&request("u1")).await.unwrap();
    orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 1);
}

/// With refunds disabled a failed request still counts against the quota.
#[tokio::test(start_paused = true)]
async fn test_refund_disabled() {
    let backend = Arc::new(ScriptedBackend::answering(Step::Status(400, "bad")));
    let mut config = gateway(vec![PresetConfig::google("main", "gemini-image", &["m"])]);
    config.orchestrator.refund_on_failure = false;
    let (orchestrator, _clock) = build(&config, &backend);

    orchestrator.execute(&request("u1")).await.unwrap_err();
    assert_eq!(orchestrator.gate().ledger().consumed(&user("u1")), 1);
}

/// Blacklisted users never reach a backend.
#[tokio::test(start_paused = true)]
async fn test_blacklisted_user() {
    let backend = Arc::new(ScriptedBackend::new());
    let mut config = gateway(vec![PresetConfig::google("main", "gemini-image", &["m"])]);
    config.policy.user_blacklist.insert("spam".to_string());
    let (orchestrator, _clock) = build(&config, &backend);

    let err = orchestrator.execute(&request("spam")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RejectedByPolicy);
    assert!(backend.calls().is_empty());
}

/// Privileged scopes skip policy, rate limit and quota.
#[tokio::test(start_paused = true)]
async fn test_privileged_bypass() {
    let backend = Arc::new(ScriptedBackend::new());
    let mut config = gateway(vec![PresetConfig::google("main", "gemini-image", &["m"])]);
    config.policy.user_blacklist.insert("admin".to_string());
    config.quota.user_limit = 1;
    let (orchestrator, _clock) = build(&config, &backend);

    let scope = AdmissionScope::user("admin").privileged();
    for _ in 0..3 {
        let req = GenerationRequest::new("x", scope.clone());
        orchestrator.execute(&req).await.unwrap();
    }
    assert_eq!(orchestrator.gate().ledger().consumed(&user("admin")), 0);
}

// ============================================================================
// Statistics
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stats_are_recorded() {
    let backend = Arc::new(ScriptedBackend::new());
    let config = gateway(vec![PresetConfig::google("main", "gemini-image", &["m"])]);
    let (orchestrator, _clock) = build(&config, &backend);

    orchestrator.execute(&request("u1")).await.unwrap();
    orchestrator.execute(&request("u1")).await.unwrap();
    orchestrator
        .execute(&request("u2").with_preset("nope"))
        .await
        .unwrap_err();

    let snapshot = orchestrator.stats().snapshot();
    assert_eq!(snapshot.requests_total, 3);
    assert_eq!(snapshot.requests_success, 2);
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.by_outcome.get("preset_not_found"), Some(&1));

    let top = orchestrator.stats().top_users(1);
    assert_eq!(top[0].id, "u1");
    assert_eq!(top[0].count, 2);
}
