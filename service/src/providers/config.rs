//! Connection preset definitions.
//!
//! A preset names one backend (provider kind, endpoint, model) and the keys
//! that may be rotated against it.  Definitions are plain serde values; where
//! they come from is the caller's business.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

/// Serialisable definition of a connection preset.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetConfig {
    pub name: String,
    #[serde(alias = "api_type")]
    pub kind: ProviderKind,
    /// Custom base URL.  `None` means the provider's default endpoint.
    #[serde(default, alias = "api_url", skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub model: String,
    /// Keys in rotation order.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl PresetConfig {
    /// Preset for Google's Generative Language API.
    pub fn google(name: &str, model: &str, keys: &[&str]) -> Self {
        Self::with_kind(ProviderKind::Google, name, model, keys)
    }

    /// Preset for an OpenAI-compatible endpoint.
    pub fn openai(name: &str, endpoint: Option<String>, model: &str, keys: &[&str]) -> Self {
        Self {
            endpoint,
            ..Self::with_kind(ProviderKind::OpenAi, name, model, keys)
        }
    }

    /// Preset for Z.ai.
    pub fn zai(name: &str, model: &str, keys: &[&str]) -> Self {
        Self::with_kind(ProviderKind::Zai, name, model, keys)
    }

    fn with_kind(kind: ProviderKind, name: &str, model: &str, keys: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            endpoint: None,
            model: model.to_string(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Effective endpoint, without a trailing slash.
    pub fn endpoint(&self) -> String {
        self.endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(self.kind.default_endpoint())
            .trim()
            .trim_end_matches('/')
            .to_string()
    }

    /// Serialise to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialise from a JSON string.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// Keys never show up in debug output.
impl std::fmt::Debug for PresetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresetConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_keys", &self.api_keys.len())
            .finish()
    }
}
