//! Error types for the Turnstile admission layer.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Turnstile operations.
///
/// None of these ever reach the request path: the limiter resolves every
/// failure to either a decision or a fail-open pass.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors that survived the fallback tier
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// A bucket key could not be derived from the request
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Unknown limiter profile
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
