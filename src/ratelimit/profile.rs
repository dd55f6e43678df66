//! Named limiter profiles.
//!
//! A profile binds a window, a maximum, a denial message and a policy. Each
//! profile gets its own limiter and its own key namespace; no counter is
//! shared between profiles.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::counter::MAX_WINDOW;
use super::key::BucketKey;
use super::policy::{KeyStrategy, LimitPolicy, SkipRule, StandardPolicy};
use crate::error::{Result, TurnstileError};

/// Denial message used when a profile does not set one.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Serializable form of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Profile name, also the key namespace
    pub name: String,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Hits allowed per window
    pub max: u64,
    /// Message returned in the denial body
    #[serde(default = "default_message")]
    pub message: String,
    /// Key derivation
    #[serde(default = "default_key")]
    pub key: KeyStrategy,
    /// Requests that bypass the limiter
    #[serde(default)]
    pub skip: SkipRule,
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_key() -> KeyStrategy {
    KeyStrategy::ClientAddress
}

impl ProfileConfig {
    /// General API traffic: moderate budget per client address.
    pub fn api() -> Self {
        Self {
            name: "api".to_string(),
            window_ms: 15 * 60 * 1000,
            max: 100,
            message: "Too many requests from this address, please try again later.".to_string(),
            key: KeyStrategy::ClientAddress,
            skip: SkipRule::default(),
        }
    }

    /// Authentication: small budget per client address and attempted email.
    pub fn auth() -> Self {
        Self {
            name: "auth".to_string(),
            window_ms: 60 * 1000,
            max: 5,
            message: "Too many authentication attempts, please try again later.".to_string(),
            key: KeyStrategy::AddressAndField {
                field: "email".to_string(),
            },
            skip: SkipRule::default(),
        }
    }

    /// Webhooks: permissive burst budget per sender address.
    pub fn webhook() -> Self {
        Self {
            name: "webhook".to_string(),
            window_ms: 60 * 1000,
            max: 1000,
            message: "Too many webhook deliveries, please slow down.".to_string(),
            key: KeyStrategy::ClientAddress,
            skip: SkipRule::default(),
        }
    }

    /// The three canonical profiles.
    pub fn canonical() -> Vec<Self> {
        vec![Self::api(), Self::auth(), Self::webhook()]
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Validate the profile.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TurnstileError::Config("profile name must not be empty".to_string()));
        }
        if self.name.contains(':') {
            return Err(TurnstileError::Config(format!(
                "profile name '{}' must not contain ':'",
                self.name
            )));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::Config(format!(
                "profile '{}': window_ms must be greater than zero",
                self.name
            )));
        }
        if self.window() > MAX_WINDOW {
            return Err(TurnstileError::Config(format!(
                "profile '{}': window_ms exceeds {} ms",
                self.name,
                MAX_WINDOW.as_millis()
            )));
        }
        if self.max == 0 {
            return Err(TurnstileError::Config(format!(
                "profile '{}': max must be greater than zero",
                self.name
            )));
        }
        Ok(())
    }

    /// Build the runtime profile with the standard policy.
    pub fn build(&self) -> LimiterProfile {
        let policy = StandardPolicy::new(self.key.clone()).with_skip(self.skip.clone());
        LimiterProfile::new(&self.name, self.window(), self.max, Arc::new(policy))
            .with_message(&self.message)
    }
}

/// A profile bound to a limiter.
#[derive(Clone)]
pub struct LimiterProfile {
    name: String,
    window: Duration,
    max: u64,
    message: String,
    policy: Arc<dyn LimitPolicy>,
}

impl std::fmt::Debug for LimiterProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterProfile")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("max", &self.max)
            .field("message", &self.message)
            .finish()
    }
}

impl LimiterProfile {
    /// Create a profile with the default denial message.
    pub fn new(name: &str, window: Duration, max: u64, policy: Arc<dyn LimitPolicy>) -> Self {
        Self {
            name: name.to_string(),
            window,
            max,
            message: DEFAULT_MESSAGE.to_string(),
            policy,
        }
    }

    /// Set the denial message.
    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn policy(&self) -> &Arc<dyn LimitPolicy> {
        &self.policy
    }

    /// Namespace a request scope under this profile.
    pub fn bucket_key(&self, scope: impl Into<String>) -> BucketKey {
        BucketKey::new(&self.name, scope)
    }
}
