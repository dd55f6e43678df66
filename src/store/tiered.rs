//! Two-tier counter store: shared first, local on failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{CounterStore, LocalStore, StoreError};
use crate::ratelimit::CounterRecord;

/// Decorator that tries the shared tier and falls back to the local tier.
///
/// The fallback decision is made per call. There is no circuit state: every
/// call tries the shared tier again, paying at most its timeout.
pub struct TieredStore {
    shared: Option<Arc<dyn CounterStore>>,
    local: Arc<LocalStore>,
}

impl TieredStore {
    /// Create a tiered store. With no shared tier every call is local.
    pub fn new(shared: Option<Arc<dyn CounterStore>>, local: Arc<LocalStore>) -> Self {
        Self { shared, local }
    }

    /// Create a store that only uses the local tier.
    pub fn local_only(local: Arc<LocalStore>) -> Self {
        Self::new(None, local)
    }

    /// Whether a shared tier is configured.
    pub fn has_shared(&self) -> bool {
        self.shared.is_some()
    }
}

#[async_trait]
impl CounterStore for TieredStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord, StoreError> {
        if let Some(shared) = &self.shared {
            match shared.increment(key, window).await {
                Ok(record) => return Ok(record),
                Err(e) => {
                    warn!(
                        key = %key,
                        store = shared.name(),
                        error = %e,
                        "Shared counter store unavailable, counting locally"
                    );
                }
            }
        }

        self.local.increment(key, window).await
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.reset(key).await {
                warn!(
                    key = %key,
                    store = shared.name(),
                    error = %e,
                    "Shared counter store unavailable, reset applied locally only"
                );
            }
        }

        self.local.reset(key).await
    }

    fn name(&self) -> &'static str {
        if self.shared.is_some() {
            "tiered"
        } else {
            "local"
        }
    }
}
