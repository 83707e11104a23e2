//! Service-wide configuration.
//!
//! [`EngineConfig`] holds the baseline values that entry points fall back to
//! when a caller passes no explicit policy.  It can be loaded from a TOML (or
//! JSON) file and refreshed from `CONCORD_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::policy::FunctionCallingPolicy;

/// Environment variable overriding [`FunctionCallingPolicy::max_rounds`].
pub const ENV_MAX_ROUNDS: &str = "CONCORD_MAX_ROUNDS";
/// Environment variable overriding the per-request timeout, in seconds.
pub const ENV_TIMEOUT_SECS: &str = "CONCORD_TIMEOUT_SECS";
/// Environment variable overriding [`EngineConfig::max_repair_attempts`].
pub const ENV_MAX_REPAIR_ATTEMPTS: &str = "CONCORD_MAX_REPAIR_ATTEMPTS";
/// Environment variable overriding [`FunctionCallingPolicy::enable_logging`].
pub const ENV_ENABLE_LOGGING: &str = "CONCORD_ENABLE_LOGGING";

/// Baseline configuration for an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Policy used when a call does not supply one.
    pub default_policy: FunctionCallingPolicy,

    /// Repair rounds allowed when a structured-output call does not say.
    pub max_repair_attempts: u32,

    /// System message installed on conversations created by the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_policy: FunctionCallingPolicy::default(),
            max_repair_attempts: 2,
            system_prompt: None,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| EngineError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file.  `.json` files are parsed as JSON, anything else as
    /// TOML.  A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = ?path, "config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            reason: format!("failed to read config file {}: {e}", path.display()),
        })?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            let config: Self =
                serde_json::from_str(&content).map_err(|e| EngineError::Config {
                    reason: format!("failed to parse JSON config: {e}"),
                })?;
            config.validate()?;
            config
        } else {
            Self::from_toml_str(&content)?
        };

        info!(path = ?path, "engine configuration loaded");
        Ok(config)
    }

    /// Apply `CONCORD_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(std::env::vars())
    }

    /// Apply `CONCORD_*` overrides from an arbitrary key/value source.
    /// Unrelated keys are ignored.
    pub fn apply_overrides_from<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                ENV_MAX_ROUNDS => self.default_policy.max_rounds = parse_env(key, value)?,
                ENV_TIMEOUT_SECS => {
                    let secs: u64 = parse_env(key, value)?;
                    self.default_policy.timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                ENV_MAX_REPAIR_ATTEMPTS => self.max_repair_attempts = parse_env(key, value)?,
                ENV_ENABLE_LOGGING => self.default_policy.enable_logging = parse_env(key, value)?,
                _ => continue,
            }
            info!(key, value, "applied environment override");
        }
        self.validate()
    }

    /// Check every contained invariant.
    pub fn validate(&self) -> Result<()> {
        self.default_policy
            .validate()
            .map_err(|e| EngineError::Config {
                reason: format!("invalid default_policy: {e}"),
            })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| EngineError::Config {
        reason: format!("invalid value for {key} (`{value}`): {e}"),
    })
}
