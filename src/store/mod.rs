//! Counter stores backing the rate limiter.
//!
//! A store owns the "increment and report the window" primitive. The shared
//! store gives cross-process counts; the local store is the in-process
//! fallback; the tiered store composes the two.

mod local;
mod shared;
mod tiered;

pub use local::LocalStore;
pub use shared::RedisStore;
pub use tiered::TieredStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::CounterRecord;

/// Transient failures a counter store may report.
///
/// The store never decides what to do about them; the caller does.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Trait for counter store implementations.
///
/// Concurrent increments of the same key must never lose an update: two
/// calls completing in order observe hit counts that differ by exactly one.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one hit for `key` and return the record after the hit.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord, StoreError>;

    /// Forget everything recorded for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}
