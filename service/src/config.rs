//! Gateway configuration.
//!
//! Everything is plain serde.  Durations are written in seconds and may be
//! fractional (`"base": 0.5`).  Every section has defaults, so an empty
//! object is a valid configuration with no presets.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::middleware::admission::PolicyConfig;
use crate::middleware::breaker::{BreakerConfig, CooldownPolicy};
use crate::middleware::quota::QuotaConfig;
use crate::middleware::ratelimit::RateLimitConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::providers::config::PresetConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration consumed by the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub policy: PolicyConfig,
    pub orchestrator: OrchestratorConfig,
    pub breaker: BreakerConfig,
    pub presets: Vec<PresetConfig>,
    /// Preset used when a request names none.  Defaults to the first preset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_preset: Option<String>,
    /// HTTP(S) proxy for every backend call and credential check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl GatewayConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let orch = &self.orchestrator;
        if orch.max_attempts == 0 {
            return Err(invalid("orchestrator.max_attempts must be at least 1"));
        }
        if orch.default_timeout.is_zero() {
            return Err(invalid("orchestrator.default_timeout must be positive"));
        }
        check_multiplier("orchestrator.backoff.multiplier", orch.backoff.multiplier)?;

        if self.rate_limit.enabled && self.rate_limit.capacity == 0 {
            return Err(invalid("rate_limit.capacity must be at least 1 when enabled"));
        }

        let breaker = &self.breaker;
        check_multiplier("breaker.probe_backoff", breaker.probe_backoff)?;
        for (name, policy) in [
            ("rate_limit", &breaker.rate_limit),
            ("transient", &breaker.transient),
            ("quota", &breaker.quota),
            ("auth", &breaker.auth),
        ] {
            check_policy(name, policy)?;
        }

        let mut seen = std::collections::HashSet::new();
        for preset in &self.presets {
            if !seen.insert(preset.name.trim()) {
                return Err(invalid(format!("duplicate preset name {}", preset.name)));
            }
        }
        for (field, name) in [
            ("current_preset", self.current_preset.as_deref()),
            ("orchestrator.fallback_preset", orch.fallback_preset.as_deref()),
        ] {
            if let Some(name) = name
                && !seen.contains(name)
            {
                return Err(invalid(format!("{field} names unknown preset {name}")));
            }
        }
        if let Some(proxy) = self.proxy_url.as_deref() {
            check_proxy(proxy)?;
        }
        Ok(())
    }
}

fn check_proxy(proxy: &str) -> Result<(), ConfigError> {
    let parsed =
        url::Url::parse(proxy).map_err(|e| invalid(format!("proxy_url {proxy}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!(
            "proxy_url {proxy}: unsupported scheme {}",
            parsed.scheme()
        )));
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn check_multiplier(field: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 1.0 {
        return Err(invalid(format!("{field} must be a finite number >= 1")));
    }
    Ok(())
}

fn check_policy(name: &str, policy: &CooldownPolicy) -> Result<(), ConfigError> {
    check_multiplier(&format!("breaker.{name}.multiplier"), policy.multiplier)?;
    if policy.cap < policy.base {
        return Err(invalid(format!("breaker.{name}.cap is below its base")));
    }
    Ok(())
}

/// `Duration` as (possibly fractional) seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }

    pub fn serialize_opt<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    /// `Option<Duration>` as optional seconds.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            super::serialize_opt(value, serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(deserializer)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
                .transpose()
        }
    }
}
