//! Per-process wiring of profiles to limiters.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::limiter::RateLimiter;
use super::profile::LimiterProfile;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};
use crate::store::{CounterStore, LocalStore, RedisStore, TieredStore};

/// Every limiter of a process, sharing one store stack.
///
/// One local store serves all profiles; keys are namespaced by profile name
/// so their counters never meet. The set owns the local store's sweep.
pub struct LimiterSet {
    /// Limiters indexed by profile name
    limiters: HashMap<String, Arc<RateLimiter>>,
    /// Profile names in configuration order
    order: Vec<String>,
    /// The process-wide fallback store
    local: Arc<LocalStore>,
    /// The store stack the limiters count against
    store: Arc<dyn CounterStore>,
}

impl LimiterSet {
    /// Build the store stack and one limiter per configured profile.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;

        let local = Arc::new(LocalStore::new(
            config.expiry,
            config.local_store.sweep_interval(),
        ));

        let shared: Option<Arc<dyn CounterStore>> = match &config.shared_store.url {
            Some(url) => {
                let redis = RedisStore::open(url, config.expiry)
                    .map_err(|e| TurnstileError::Config(format!("invalid shared store url: {}", e)))?
                    .with_timeout(config.shared_store.timeout())
                    .with_key_prefix(config.shared_store.key_prefix.clone());
                info!(timeout = ?redis.timeout(), "Shared counter store configured");
                Some(Arc::new(redis) as Arc<dyn CounterStore>)
            }
            None => {
                warn!("No shared counter store configured, limits are per process");
                None
            }
        };

        let store: Arc<dyn CounterStore> = Arc::new(TieredStore::new(shared, local.clone()));
        let profiles = config.profiles.iter().map(|p| p.build()).collect();

        Self::with_store(profiles, local, store)
    }

    /// Wire the given profiles to an existing store stack.
    pub fn with_store(
        profiles: Vec<LimiterProfile>,
        local: Arc<LocalStore>,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        let mut limiters = HashMap::new();
        let mut order = Vec::new();

        for profile in profiles {
            let name = profile.name().to_string();
            if limiters.contains_key(&name) {
                return Err(TurnstileError::Config(format!("duplicate profile '{}'", name)));
            }

            info!(
                profile = %name,
                window = ?profile.window(),
                max = profile.max(),
                "Limiter profile registered"
            );
            limiters.insert(name.clone(), Arc::new(RateLimiter::new(profile, store.clone())));
            order.push(name);
        }

        Ok(Self {
            limiters,
            order,
            local,
            store,
        })
    }

    /// Get the limiter for a profile.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).cloned()
    }

    /// Get the limiter for a profile, or an error naming it.
    pub fn require(&self, name: &str) -> Result<Arc<RateLimiter>> {
        self.get(name)
            .ok_or_else(|| TurnstileError::UnknownProfile(name.to_string()))
    }

    /// Profile names in configuration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// The process-wide fallback store.
    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local
    }

    /// Name of the store stack, for logs.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Start the fallback store's sweep. Must run inside a tokio runtime.
    pub fn start(&self) -> bool {
        self.local.start()
    }

    /// Stop the sweep.
    pub async fn shutdown(&self) {
        self.local.stop().await;
        info!("Limiter set shut down");
    }
}
