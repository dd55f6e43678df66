//! Per-profile capabilities: key derivation, skipping, and the denial response.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::limiter::Decision;
use crate::error::{Result, TurnstileError};
use crate::pipeline::{Rejection, RequestContext};

/// Marker used in place of a submitted field the request did not carry.
const MISSING_FIELD: &str = "-";

/// Capabilities a limiter profile plugs in.
///
/// Only `derive_key` is required; the defaults never skip and deny with the
/// standard 429 response.
pub trait LimitPolicy: Send + Sync {
    /// Derive the request's scope within the profile.
    fn derive_key(&self, request: &dyn RequestContext) -> Result<String>;

    /// Whether the request bypasses the limiter entirely.
    fn should_skip(&self, _request: &dyn RequestContext) -> bool {
        false
    }

    /// Build the response for a request over the limit.
    fn on_exceeded(
        &self,
        _request: &dyn RequestContext,
        decision: &Decision,
        message: &str,
    ) -> Rejection {
        Rejection::too_many_requests(decision, message)
    }
}

/// How a bucket key is derived from a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// The client network address alone.
    ClientAddress,
    /// The client network address combined with a submitted field.
    AddressAndField { field: String },
}

impl KeyStrategy {
    /// Derive the scope for a request.
    pub fn derive(&self, request: &dyn RequestContext) -> Result<String> {
        let addr = request.client_addr().ok_or_else(|| {
            TurnstileError::KeyDerivation(format!(
                "client address unavailable for {}",
                request.path()
            ))
        })?;

        match self {
            KeyStrategy::ClientAddress => Ok(addr.to_string()),
            KeyStrategy::AddressAndField { field } => {
                let value = request
                    .field(field)
                    .map(|v| v.trim().to_lowercase())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| MISSING_FIELD.to_string());
                Ok(format!("{}|{}", addr, value))
            }
        }
    }
}

/// Requests that bypass the limiter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRule {
    /// Trusted client addresses
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    /// Exempt path prefixes, e.g. health checks
    #[serde(default)]
    pub path_prefixes: Vec<String>,
}

impl SkipRule {
    /// Whether the request matches the rule.
    pub fn matches(&self, request: &dyn RequestContext) -> bool {
        if let Some(addr) = request.client_addr() {
            if self.addresses.contains(&addr) {
                return true;
            }
        }

        let path = request.path();
        self.path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// The policy built from configuration: a key strategy plus a skip rule.
#[derive(Debug, Clone)]
pub struct StandardPolicy {
    key: KeyStrategy,
    skip: SkipRule,
}

impl StandardPolicy {
    /// Create a policy with no skip rule.
    pub fn new(key: KeyStrategy) -> Self {
        Self {
            key,
            skip: SkipRule::default(),
        }
    }

    /// Set the skip rule.
    pub fn with_skip(mut self, skip: SkipRule) -> Self {
        self.skip = skip;
        self
    }
}

impl LimitPolicy for StandardPolicy {
    fn derive_key(&self, request: &dyn RequestContext) -> Result<String> {
        self.key.derive(request)
    }

    fn should_skip(&self, request: &dyn RequestContext) -> bool {
        self.skip.matches(request)
    }
}
