pub mod classify;
pub mod config;
pub mod http;
pub mod retry;

// Re-export for convenience
pub use classify::{Disposition, FailureClass, classify};
pub use http::HttpBackend;
pub use retry::{RetryConfig, RetryState, RetryStep, StopReason};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::middleware::store::{CredentialId, Secret};

// ---------------------------------------------------------------------------
// Provider kinds
// ---------------------------------------------------------------------------

/// Backend families a preset can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Google Generative Language API (`generateContent`).
    Google,
    /// OpenAI or any OpenAI-compatible image endpoint.
    #[serde(rename = "openai", alias = "openai-compatible", alias = "openai_compatible")]
    OpenAi,
    /// Zhipu Z.ai image generation.
    Zai,
}

impl ProviderKind {
    /// Canonical slug (`"google"`, `"openai"`, `"zai"`).
    pub fn slug(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::OpenAi => "openai",
            Self::Zai => "zai",
        }
    }

    /// Endpoint used when a preset does not name one.
    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::Google => "https://generativelanguage.googleapis.com",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Zai => "https://open.bigmodel.cn/api/paas/v4",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

// ---------------------------------------------------------------------------
// Call and outcome types
// ---------------------------------------------------------------------------

/// Everything an adapter needs to reach one backend with one credential.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub kind: ProviderKind,
    pub preset: String,
    pub endpoint: String,
    pub model: String,
    pub credential: CredentialId,
    pub secret: Secret,
}

/// The resolved generation input handed to a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Requested output resolution, e.g. `"1K"`, `"2K"` or `"1024x1024"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    /// Provider-specific fields merged into the request body as-is.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Successful backend response.  The body is opaque to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendPayload {
    pub model: String,
    pub body: serde_json::Value,
}

/// Raw failure signal reported by a backend, before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "code")]
pub enum FailureSignal {
    /// Non-success HTTP status.
    Status(u16),
    /// The call did not finish within its budget.
    Timeout,
    /// Connection could not be established or was reset.
    Connect,
    /// The backend answered 200 but the body carried no usable result.
    Malformed,
    /// Anything the adapter could not attribute.
    Other,
}

/// A failed backend call.
#[derive(Debug, Clone, Error)]
#[error("{signal:?}: {message}")]
pub struct BackendFailure {
    pub signal: FailureSignal,
    pub message: String,
}

impl BackendFailure {
    pub fn new(signal: FailureSignal, message: impl Into<String>) -> Self {
        Self {
            signal,
            message: message.into(),
        }
    }

    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::new(FailureSignal::Status(code), message)
    }

    pub fn timeout() -> Self {
        Self::new(FailureSignal::Timeout, "request timed out")
    }
}

/// Result of one backend invocation.
pub type BackendOutcome = Result<BackendPayload, BackendFailure>;

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Common interface for every image-generation backend.
///
/// Adapters only translate: build the provider request, send it, and turn the
/// answer into a [`BackendOutcome`].  Key selection, retries and cooldowns are
/// the orchestrator's job.
pub trait BackendAdapter: Send + Sync {
    /// Run one generation against `target`, giving up after `budget`.
    fn invoke(
        &self,
        target: &BackendTarget,
        payload: &GenerationPayload,
        budget: Duration,
    ) -> impl Future<Output = BackendOutcome> + Send;

    /// List the models visible to the target credential.
    ///
    /// Used for credential health checks.  The default reports no models.
    fn list_models(
        &self,
        _target: &BackendTarget,
        _budget: Duration,
    ) -> impl Future<Output = Result<Vec<String>, BackendFailure>> + Send {
        async { Ok(Vec::new()) }
    }
}

// ---------------------------------------------------------------------------
// Dyn-compatible wrapper for BackendAdapter
// ---------------------------------------------------------------------------

type ModelsFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<String>, BackendFailure>> + Send + 'a>>;

/// Object-safe version of [`BackendAdapter`], using boxed futures.
///
/// Auto-implemented for every `T: BackendAdapter + 'static`.
pub trait BackendAdapterDyn: Send + Sync {
    fn invoke_dyn<'a>(
        &'a self,
        target: &'a BackendTarget,
        payload: &'a GenerationPayload,
        budget: Duration,
    ) -> Pin<Box<dyn Future<Output = BackendOutcome> + Send + 'a>>;

    fn list_models_dyn<'a>(&'a self, target: &'a BackendTarget, budget: Duration)
    -> ModelsFuture<'a>;
}

impl<T: BackendAdapter + 'static> BackendAdapterDyn for T {
    fn invoke_dyn<'a>(
        &'a self,
        target: &'a BackendTarget,
        payload: &'a GenerationPayload,
        budget: Duration,
    ) -> Pin<Box<dyn Future<Output = BackendOutcome> + Send + 'a>> {
        Box::pin(self.invoke(target, payload, budget))
    }

    fn list_models_dyn<'a>(
        &'a self,
        target: &'a BackendTarget,
        budget: Duration,
    ) -> ModelsFuture<'a> {
        Box::pin(self.list_models(target, budget))
    }
}
