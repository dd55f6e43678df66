//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{ExpiryMode, ProfileConfig};

/// Prefix of environment variables overriding file settings,
/// e.g. `TURNSTILE__SHARED_STORE__URL`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Shared counter store configuration
    #[serde(default)]
    pub shared_store: SharedStoreConfig,

    /// Local fallback store configuration
    #[serde(default)]
    pub local_store: LocalStoreConfig,

    /// Expiry mode applied by both stores
    #[serde(default)]
    pub expiry: ExpiryMode,

    /// Limiter profiles
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileConfig>,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            shared_store: SharedStoreConfig::default(),
            local_store: LocalStoreConfig::default(),
            expiry: ExpiryMode::default(),
            profiles: default_profiles(),
        }
    }
}

fn default_profiles() -> Vec<ProfileConfig> {
    ProfileConfig::canonical()
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStoreConfig {
    /// Redis URL; without one every count is local
    #[serde(default)]
    pub url: Option<String>,

    /// Bound on each store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for keys written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl SharedStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

/// Local fallback store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LocalStoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: TurnstileConfig = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(format!("Failed to load {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the limiter cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.shared_store.timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "shared_store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.local_store.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "local_store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.profiles.is_empty() {
            return Err(TurnstileError::Config("at least one profile is required".to_string()));
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !seen.insert(profile.name.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "duplicate profile '{}'",
                    profile.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a profile by name.
    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.iter().find(|p| p.name == name)
    }
}
