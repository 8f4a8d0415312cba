//! Request and result types at the orchestrator boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::secs;
use crate::error::GenerationError;
use crate::middleware::store::CredentialId;
use crate::providers::{BackendPayload, GenerationPayload};

/// Who is asking.  Rate limits and quotas are tracked against these ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionScope {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Operators skip admission entirely.
    #[serde(default)]
    pub privileged: bool,
}

impl AdmissionScope {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Key of the token bucket this scope draws from: the group if any,
    /// otherwise the user.
    pub fn bucket_key(&self) -> String {
        match &self.group_id {
            Some(group) => format!("group:{group}"),
            None => format!("user:{}", self.user_id),
        }
    }
}

/// Per-request knobs.  Anything unset falls back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOverrides {
    #[serde(default, with = "secs::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Provider-specific fields passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A fully resolved generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Target preset; `None`, an empty name or `"current"` means the
    /// current preset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default)]
    pub overrides: RequestOverrides,
    pub scope: AdmissionScope,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, scope: AdmissionScope) -> Self {
        Self {
            prompt: prompt.into(),
            preset: None,
            overrides: RequestOverrides::default(),
            scope,
        }
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.timeout = Some(timeout);
        self
    }

    /// What the backend adapter sees.
    pub fn payload(&self) -> GenerationPayload {
        GenerationPayload {
            prompt: self.prompt.clone(),
            negative_prompt: self.overrides.negative_prompt.clone(),
            resolution: self.overrides.resolution.clone(),
            aspect_ratio: self.overrides.aspect_ratio.clone(),
            extra: self.overrides.extra.clone(),
        }
    }
}

/// A successful generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    pub payload: BackendPayload,
    pub preset: String,
    pub credential: CredentialId,
    pub fingerprint: String,
    pub attempts: u32,
    #[serde(with = "secs")]
    pub elapsed: Duration,
}

pub type GenerationResult = Result<GenerationOutput, GenerationError>;
