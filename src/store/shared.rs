//! Redis-backed counter store shared by every process.
//!
//! Each increment is one MULTI/EXEC round trip, so Redis' own atomicity
//! serializes concurrent hits on a key across all instances.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{CounterStore, StoreError};
use crate::ratelimit::{CounterRecord, ExpiryMode};

/// Default bound on a single store round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
/// Default prefix for keys written to Redis.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:";

/// Counter store backed by a Redis server.
pub struct RedisStore {
    /// Redis client (connects lazily)
    client: redis::Client,
    /// Cached multiplexed connection, dropped after a failure
    connection: Mutex<Option<MultiplexedConnection>>,
    /// Prefix prepended to every key
    key_prefix: String,
    /// Bound on each call, connection setup included
    timeout: Duration,
    /// Expiry arming mode
    expiry: ExpiryMode,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given Redis URL. No connection is made yet.
    pub fn open(url: &str, expiry: ExpiryMode) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
            expiry,
        })
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// The per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Build the single round trip that records a hit.
    ///
    /// Fixed: arm the expiry only when the key is created, then count.
    /// Sliding: count, then re-arm the expiry on every hit.
    /// Both end with PTTL so the caller learns when the window lapses.
    fn increment_pipeline(&self, store_key: &str, window_ms: u64) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();

        match self.expiry {
            ExpiryMode::Fixed => {
                pipe.cmd("SET")
                    .arg(store_key)
                    .arg(0)
                    .arg("NX")
                    .arg("PX")
                    .arg(window_ms)
                    .ignore()
                    .cmd("INCR")
                    .arg(store_key);
            }
            ExpiryMode::Sliding => {
                pipe.cmd("INCR")
                    .arg(store_key)
                    .cmd("PEXPIRE")
                    .arg(store_key)
                    .arg(window_ms)
                    .ignore();
            }
        }

        pipe.cmd("PTTL").arg(store_key);
        pipe
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Connected to shared counter store");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next call reconnects.
    fn invalidate(&self) {
        // A caller holding the lock is mid-connect; its result will be fresh
        if let Ok(mut slot) = self.connection.try_lock() {
            slot.take();
        }
    }

    /// Run one store call under the timeout.
    async fn bounded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.invalidate();
                Err(e)
            }
            Err(_) => {
                self.invalidate();
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord, StoreError> {
        let store_key = self.store_key(key);
        let window_ms = (window.as_millis() as u64).max(1);
        let pipe = self.increment_pipeline(&store_key, window_ms);

        let (hits, ttl_ms): (u64, i64) = self
            .bounded(async {
                let mut conn = self.connection().await?;
                let reply: (u64, i64) = pipe.query_async(&mut conn).await?;
                Ok::<_, StoreError>(reply)
            })
            .await?;

        // PTTL is negative only if the key vanished or lost its expiry
        let remaining_ms = if ttl_ms > 0 { ttl_ms } else { window_ms as i64 };

        trace!(key = %store_key, hits = hits, ttl_ms = ttl_ms, "Shared counter incremented");

        Ok(CounterRecord {
            hits,
            reset_at: Utc::now() + chrono::Duration::milliseconds(remaining_ms),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        let store_key = self.store_key(key);
        self.bounded(async {
            let mut conn = self.connection().await?;
            let _: () = redis::cmd("DEL").arg(&store_key).query_async(&mut conn).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
