//! Preset routing and failover.
//!
//! A request targets either the preset it names or the store's current
//! preset.  If a fallback preset is configured it is tried once, after the
//! primary has nothing left to offer.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::middleware::store::CredentialStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("preset not found: {0}")]
    PresetNotFound(String),
    #[error("no preset requested and no current preset set")]
    NoCurrentPreset,
}

/// Ordered presets for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutePlan {
    pub primary: String,
    pub fallback: Option<String>,
}

impl RoutePlan {
    /// The preset to switch to after `current` is exhausted, if any.
    pub fn next_target(&self, current: &str) -> Option<&str> {
        match &self.fallback {
            Some(fallback) if current == self.primary && fallback != current => {
                Some(fallback.as_str())
            }
            _ => None,
        }
    }
}

/// Request preset name that stands for the current preset.
pub const CURRENT_ALIAS: &str = "current";

/// Resolves request targets against the credential store.
#[derive(Clone)]
pub struct PresetRouter {
    store: Arc<CredentialStore>,
    fallback: Option<String>,
}

impl PresetRouter {
    pub fn new(store: Arc<CredentialStore>, fallback: Option<String>) -> Self {
        Self { store, fallback }
    }

    /// Primary preset for a request: the explicit one wins over current.
    ///
    /// An empty name or the word `current` selects the current preset,
    /// unless a preset is actually named `current`.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<String, RouteError> {
        let explicit = explicit.map(str::trim).filter(|s| !s.is_empty());
        match explicit {
            Some(name) if self.store.contains(name) => Ok(name.to_string()),
            Some(CURRENT_ALIAS) => self.current(),
            Some(name) => Err(RouteError::PresetNotFound(name.to_string())),
            None => self.current(),
        }
    }

    fn current(&self) -> Result<String, RouteError> {
        let current = self.store.current().ok_or(RouteError::NoCurrentPreset)?;
        if self.store.contains(&current) {
            Ok(current)
        } else {
            Err(RouteError::PresetNotFound(current))
        }
    }

    /// Fallback for `primary`: configured, present in the store, and not
    /// the primary itself.
    pub fn fallback_for(&self, primary: &str) -> Option<String> {
        let fallback = self.fallback.as_deref()?;
        if fallback == primary {
            return None;
        }
        if !self.store.contains(fallback) {
            tracing::warn!(fallback = %fallback, "fallback preset missing from store");
            return None;
        }
        Some(fallback.to_string())
    }

    pub fn plan(&self, explicit: Option<&str>) -> Result<RoutePlan, RouteError> {
        let primary = self.resolve(explicit)?;
        let fallback = self.fallback_for(&primary);
        Ok(RoutePlan { primary, fallback })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::config::PresetConfig;

    fn store(names: &[&str]) -> Arc<CredentialStore> {
        let store = CredentialStore::new();
        for name in names {
            store
                .add_preset(PresetConfig::google(name, "gemini", &["k"]))
                .unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn explicit_preset_beats_current() {
        let router = PresetRouter::new(store(&["main", "alt"]), None);
        assert_eq!(router.resolve(None).unwrap(), "main");
        assert_eq!(router.resolve(Some("alt")).unwrap(), "alt");
        assert_eq!(
            router.resolve(Some("nope")),
            Err(RouteError::PresetNotFound("nope".to_string()))
        );
    }

    #[test]
    fn current_alias_selects_current_preset() {
        let router = PresetRouter::new(store(&["main", "alt"]), None);
        assert_eq!(router.resolve(Some("current")).unwrap(), "main");
        assert_eq!(router.resolve(Some(" current ")).unwrap(), "main");
        assert_eq!(router.resolve(Some("")).unwrap(), "main");

        let named = PresetRouter::new(store(&["main", "current"]), None);
        assert_eq!(named.resolve(Some("current")).unwrap(), "current");
    }

    #[test]
    fn no_current_preset() {
        let router = PresetRouter::new(Arc::new(CredentialStore::new()), None);
        assert_eq!(router.resolve(None), Err(RouteError::NoCurrentPreset));
    }

    #[test]
    fn fallback_is_secondary_and_used_once() {
        let router = PresetRouter::new(store(&["main", "alt", "backup"]), Some("backup".into()));
        let plan = router.plan(Some("alt")).unwrap();
        assert_eq!(plan.primary, "alt");
        assert_eq!(plan.next_target("alt"), Some("backup"));
        assert_eq!(plan.next_target("backup"), None);
    }

    #[test]
    fn fallback_never_equals_primary() {
        let router = PresetRouter::new(store(&["main"]), Some("main".into()));
        let plan = router.plan(None).unwrap();
        assert_eq!(plan.fallback, None);
        assert_eq!(plan.next_target("main"), None);
    }

    #[test]
    fn missing_fallback_is_ignored() {
        let router = PresetRouter::new(store(&["main"]), Some("gone".into()));
        assert_eq!(router.fallback_for("main"), None);
    }
}
