//! Mapping from raw backend signals to failure classes.
//!
//! This is the only place that interprets provider status codes and error
//! bodies.  New providers with unusual signalling get a branch here.

use serde::{Deserialize, Serialize};

use crate::providers::{BackendFailure, FailureSignal};

/// Body fragments that turn a 429 into "out of credits" rather than "busy".
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "billing",
    "insufficient",
    "balance",
    "credit",
    "余额",
];

/// Classified failure, the input to the circuit breaker and the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Provider said "too many requests".
    RateLimited,
    /// Balance or credits for this key are gone.
    QuotaExhausted,
    /// Key rejected as invalid or unauthorised.
    AuthFailure,
    /// Network trouble or a server-side error.
    Transient,
    /// The call was abandoned because its time budget ran out.
    Timeout,
    /// Nothing we recognise.
    Unclassified,
}

/// What the retry loop does after a failure of a given class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try again, with backoff, on another credential.
    Retry,
    /// This credential is done; move to the next one immediately.
    NextCredential,
    /// Stop and surface the error.
    Stop,
}

impl FailureClass {
    pub fn disposition(self) -> Disposition {
        match self {
            Self::RateLimited | Self::Transient | Self::Timeout => Disposition::Retry,
            Self::QuotaExhausted | Self::AuthFailure => Disposition::NextCredential,
            Self::Unclassified => Disposition::Stop,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::AuthFailure => "auth_failure",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Unclassified => "unclassified",
        }
    }
}

/// Classify a backend failure.
pub fn classify(failure: &BackendFailure) -> FailureClass {
    match failure.signal {
        FailureSignal::Status(code) => classify_status(code, &failure.message),
        FailureSignal::Timeout => FailureClass::Timeout,
        FailureSignal::Connect | FailureSignal::Malformed => FailureClass::Transient,
        FailureSignal::Other => FailureClass::Unclassified,
    }
}

/// Classify an HTTP status together with its response body.
pub fn classify_status(code: u16, body: &str) -> FailureClass {
    match code {
        401 | 403 => FailureClass::AuthFailure,
        402 => FailureClass::QuotaExhausted,
        429 if mentions_quota(body) => FailureClass::QuotaExhausted,
        429 => FailureClass::RateLimited,
        408 | 500..=599 => FailureClass::Transient,
        _ => FailureClass::Unclassified,
    }
}

fn mentions_quota(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_MARKERS.iter().any(|m| lower.contains(m))
}
