//! Task configuration and live re-validation.
//!
//! Keys mirror what the configuration store persists. Updates arrive as
//! key/value pairs and are validated individually: out-of-range values are
//! logged and ignored, keeping the prior value.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::AgentError;
use crate::guard::LimitSet;
use crate::judge::Severity;
use crate::model::ModelEngine;

/// Configuration store keys.
pub mod keys {
    pub const MAX_OPS: &str = "maxOps";
    pub const MAX_NOOPS: &str = "maxNoops";
    pub const MAX_FAILURES: &str = "maxFailures";
    pub const MAX_FAILURE_OR_NOOP_STREAK: &str = "maxFailureOrNoopStreak";
    pub const MONITOR_MODE: &str = "monitorMode";
    pub const AUTO_MONITOR_THRESHOLD: &str = "autoMonitorThreshold";
    pub const AI_PROVIDER_TYPE: &str = "aiProviderType";
    pub const EULA_ACCEPTANCE: &str = "eulaAcceptance";
    pub const ANTHROPIC_API_KEY: &str = "anthropicApiKey";
    pub const OPENAI_API_KEY: &str = "openaiApiKey";
}

/// Supported model vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProviderType {
    Anthropic,
    OpenAi,
}

impl AiProviderType {
    /// The config key holding this provider's API key.
    pub fn api_key_config_key(&self) -> &'static str {
        match self {
            Self::Anthropic => keys::ANTHROPIC_API_KEY,
            Self::OpenAi => keys::OPENAI_API_KEY,
        }
    }
}

impl fmt::Display for AiProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAi => write!(f, "openai"),
        }
    }
}

impl FromStr for AiProviderType {
    type Err = AgentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(AgentError::Config(format!(
                "unknown AI provider '{other}'"
            ))),
        }
    }
}

/// Result of applying one configuration update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEffect {
    Applied,
    /// The value was invalid; the prior value was kept.
    Ignored,
    /// The AI provider changed; the model engine must be rebuilt.
    EngineRebuildRequired,
}

/// Validated agent configuration. A task snapshots this at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub limits: LimitSet,
    /// Persistent user preference: every action awaits human approval.
    pub monitor_mode: bool,
    pub auto_monitor_threshold: Severity,
    pub ai_provider: AiProviderType,
    pub eula_accepted: bool,
    /// API keys by config key name.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            limits: LimitSet {
                max_ops: 50,
                max_noops: 7,
                max_failures: 10,
                max_failure_or_noop_streak: 7,
            },
            monitor_mode: false,
            auto_monitor_threshold: Severity::Medium,
            ai_provider: AiProviderType::Anthropic,
            eula_accepted: false,
            api_keys: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Build a config from a stored key/value map, validating each entry.
    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut config = Self::default();
        for (key, value) in map {
            config.apply_update(key, value);
        }
        config
    }

    /// API key stored for the given provider.
    pub fn api_key_for(&self, provider: AiProviderType) -> Option<&str> {
        self.api_keys
            .get(provider.api_key_config_key())
            .map(String::as_str)
    }

    /// Apply one configuration update, validating the value.
    pub fn apply_update(&mut self, key: &str, value: &serde_json::Value) -> ConfigEffect {
        match key {
            keys::MAX_OPS => self.update_limit(key, value, |limits| &mut limits.max_ops),
            keys::MAX_NOOPS => self.update_limit(key, value, |limits| &mut limits.max_noops),
            keys::MAX_FAILURES => self.update_limit(key, value, |limits| &mut limits.max_failures),
            keys::MAX_FAILURE_OR_NOOP_STREAK => {
                self.update_limit(key, value, |limits| &mut limits.max_failure_or_noop_streak)
            }
            keys::MONITOR_MODE => match value.as_bool() {
                Some(flag) => {
                    self.monitor_mode = flag;
                    ConfigEffect::Applied
                }
                None => self.reject(key, value),
            },
            keys::AUTO_MONITOR_THRESHOLD => {
                match value.as_str().map(str::parse::<Severity>) {
                    Some(Ok(severity)) => {
                        self.auto_monitor_threshold = severity;
                        ConfigEffect::Applied
                    }
                    _ => self.reject(key, value),
                }
            }
            keys::AI_PROVIDER_TYPE => match value.as_str().map(str::parse::<AiProviderType>) {
                Some(Ok(provider)) => {
                    if provider == self.ai_provider {
                        ConfigEffect::Applied
                    } else {
                        self.ai_provider = provider;
                        ConfigEffect::EngineRebuildRequired
                    }
                }
                _ => self.reject(key, value),
            },
            keys::EULA_ACCEPTANCE => match value.as_bool() {
                Some(flag) => {
                    self.eula_accepted = flag;
                    ConfigEffect::Applied
                }
                None => self.reject(key, value),
            },
            keys::ANTHROPIC_API_KEY | keys::OPENAI_API_KEY => match value.as_str() {
                Some(api_key) if !api_key.is_empty() => {
                    self.api_keys.insert(key.to_string(), api_key.to_string());
                    ConfigEffect::Applied
                }
                _ => self.reject(key, value),
            },
            other => {
                warn!(key = other, "ignoring unknown configuration key");
                ConfigEffect::Ignored
            }
        }
    }

    fn update_limit(
        &mut self,
        key: &str,
        value: &serde_json::Value,
        field: impl FnOnce(&mut LimitSet) -> &mut u32,
    ) -> ConfigEffect {
        match value.as_u64() {
            Some(parsed) if parsed > 0 && parsed <= u32::MAX as u64 => {
                *field(&mut self.limits) = parsed as u32;
                ConfigEffect::Applied
            }
            _ => self.reject(key, value),
        }
    }

    fn reject(&self, key: &str, value: &serde_json::Value) -> ConfigEffect {
        warn!(key, %value, "ignoring out-of-range configuration value");
        ConfigEffect::Ignored
    }
}

/// Builds model engines for a provider/API-key pair. Implemented by the
/// application shell; consulted at task start and when the provider changes.
pub trait EngineFactory: Send + Sync {
    fn build(
        &self,
        provider: AiProviderType,
        api_key: &str,
    ) -> Result<Arc<dyn ModelEngine>, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_limits_reject_non_positive_values() {
        let mut config = AgentConfig::default();
        let prior = config.limits.max_ops;

        assert_eq!(
            config.apply_update(keys::MAX_OPS, &json!(0)),
            ConfigEffect::Ignored
        );
        assert_eq!(config.limits.max_ops, prior);

        assert_eq!(
            config.apply_update(keys::MAX_OPS, &json!(-3)),
            ConfigEffect::Ignored
        );
        assert_eq!(config.limits.max_ops, prior);

        assert_eq!(
            config.apply_update(keys::MAX_OPS, &json!(25)),
            ConfigEffect::Applied
        );
        assert_eq!(config.limits.max_ops, 25);
    }

    #[test]
    fn test_threshold_must_be_a_severity_name() {
        let mut config = AgentConfig::default();
        assert_eq!(
            config.apply_update(keys::AUTO_MONITOR_THRESHOLD, &json!("HIGH")),
            ConfigEffect::Applied
        );
        assert_eq!(config.auto_monitor_threshold, Severity::High);

        assert_eq!(
            config.apply_update(keys::AUTO_MONITOR_THRESHOLD, &json!("EXTREME")),
            ConfigEffect::Ignored
        );
        assert_eq!(config.auto_monitor_threshold, Severity::High);
    }

    #[test]
    fn test_provider_change_requires_engine_rebuild() {
        let mut config = AgentConfig::default();
        assert_eq!(
            config.apply_update(keys::AI_PROVIDER_TYPE, &json!("anthropic")),
            ConfigEffect::Applied
        );
        assert_eq!(
            config.apply_update(keys::AI_PROVIDER_TYPE, &json!("openai")),
            ConfigEffect::EngineRebuildRequired
        );
        assert_eq!(config.ai_provider, AiProviderType::OpenAi);
    }

    #[test]
    fn test_api_keys_stored_per_provider() {
        let mut config = AgentConfig::default();
        config.apply_update(keys::ANTHROPIC_API_KEY, &json!("sk-test"));
        assert_eq!(config.api_key_for(AiProviderType::Anthropic), Some("sk-test"));
        assert_eq!(config.api_key_for(AiProviderType::OpenAi), None);
    }

    #[test]
    fn test_from_map_applies_known_keys() {
        let map = json!({
            "maxOps": 10,
            "monitorMode": true,
            "eulaAcceptance": true,
            "unknownKey": "whatever"
        });
        let config = AgentConfig::from_map(map.as_object().unwrap());
        assert_eq!(config.limits.max_ops, 10);
        assert!(config.monitor_mode);
        assert!(config.eula_accepted);
    }
}
