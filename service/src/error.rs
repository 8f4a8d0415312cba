//! Terminal failure kinds surfaced by the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::middleware::admission::Rejection;
use crate::middleware::store::CredentialId;
use crate::providers::FailureClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Blacklisted, or missing from a non-empty whitelist.
    RejectedByPolicy,
    /// The scope's token bucket is empty.
    RateLimited,
    /// A daily quota ledger is exhausted.
    QuotaExceeded,
    /// The request names a preset the store does not have.
    PresetNotFound,
    /// Every credential of the target preset is cooling down.
    NoUsableCredential,
    BackendRateLimited,
    BackendQuotaExhausted,
    BackendAuthFailure,
    BackendTransient,
    DeadlineExceeded,
    BackendUnclassifiedFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RejectedByPolicy => "rejected_by_policy",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::PresetNotFound => "preset_not_found",
            Self::NoUsableCredential => "no_usable_credential",
            Self::BackendRateLimited => "backend_rate_limited",
            Self::BackendQuotaExhausted => "backend_quota_exhausted",
            Self::BackendAuthFailure => "backend_auth_failure",
            Self::BackendTransient => "backend_transient",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::BackendUnclassifiedFailure => "backend_unclassified_failure",
        }
    }

    /// Whether the failure happened before any backend call.
    pub fn is_admission(self) -> bool {
        matches!(
            self,
            Self::RejectedByPolicy | Self::RateLimited | Self::QuotaExceeded
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FailureClass> for ErrorKind {
    fn from(class: FailureClass) -> Self {
        match class {
            FailureClass::RateLimited => Self::BackendRateLimited,
            FailureClass::QuotaExhausted => Self::BackendQuotaExhausted,
            FailureClass::AuthFailure => Self::BackendAuthFailure,
            FailureClass::Transient | FailureClass::Timeout => Self::BackendTransient,
            FailureClass::Unclassified => Self::BackendUnclassifiedFailure,
        }
    }
}

/// A terminal failure, with the context it came from.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct GenerationError {
    pub kind: ErrorKind,
    pub message: String,
    /// Preset in use when the request failed, if it got that far.
    pub preset: Option<String>,
    /// Credential whose failure ended the request.
    pub credential: Option<CredentialId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub attempts: u32,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            preset: None,
            credential: None,
            fingerprint: None,
            attempts: 0,
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn with_credential(mut self, credential: CredentialId, fingerprint: String) -> Self {
        self.credential = Some(credential);
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl From<Rejection> for GenerationError {
    fn from(rejection: Rejection) -> Self {
        let kind = match rejection {
            Rejection::Policy(_) => ErrorKind::RejectedByPolicy,
            Rejection::RateLimited { .. } => ErrorKind::RateLimited,
            Rejection::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
        };
        Self::new(kind, rejection.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_classes_map_to_backend_kinds() {
        assert_eq!(
            ErrorKind::from(FailureClass::RateLimited),
            ErrorKind::BackendRateLimited
        );
        assert_eq!(
            ErrorKind::from(FailureClass::Timeout),
            ErrorKind::BackendTransient
        );
        assert_eq!(
            ErrorKind::from(FailureClass::Unclassified),
            ErrorKind::BackendUnclassifiedFailure
        );
    }

    #[test]
    fn display_includes_kind() {
        let err = GenerationError::new(ErrorKind::NoUsableCredential, "all keys cooling")
            .with_preset("main")
            .with_attempts(2);
        assert_eq!(err.to_string(), "no_usable_credential: all keys cooling");
        assert_eq!(err.preset.as_deref(), Some("main"));
        assert!(!err.kind.is_admission());
        assert!(ErrorKind::QuotaExceeded.is_admission());
    }
}
