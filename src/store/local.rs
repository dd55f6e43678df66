//! In-process counter store.
//!
//! Counters live in a sharded map: an increment locks only the shard that
//! holds its key, so increments of one key are serialized while unrelated
//! keys proceed. A background sweep drops lapsed records to bound memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CounterStore, StoreError};
use crate::ratelimit::{CounterRecord, ExpiryMode};

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle to a running sweep task.
struct SweepTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Per-process counter store.
///
/// In a multi-instance deployment these counts are per instance, so while
/// the shared store is down the effective aggregate limit is
/// `max * instances`.
pub struct LocalStore {
    /// Counter records indexed by store key
    records: DashMap<String, CounterRecord>,
    /// Expiry arming mode
    expiry: ExpiryMode,
    /// Time between sweeps
    sweep_interval: Duration,
    /// The running sweep task, if started
    sweeper: Mutex<Option<SweepTask>>,
}

impl LocalStore {
    /// Create a new local store. The sweep is not started.
    pub fn new(expiry: ExpiryMode, sweep_interval: Duration) -> Self {
        Self {
            records: DashMap::new(),
            expiry,
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Record one hit for `key` at `now`.
    pub fn increment_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> CounterRecord {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| CounterRecord::new(now, window));

        record.hit(now, window, self.expiry);
        *record
    }

    /// Get the current record for a key, expired or not.
    pub fn get(&self, key: &str) -> Option<CounterRecord> {
        self.records.get(key).map(|r| *r)
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record that has lapsed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Remove every record that has lapsed at `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Start the background sweep.
    ///
    /// Must be called from within a tokio runtime. Returns `false` if the
    /// sweep is already running. The task only holds a weak reference, so
    /// dropping the last strong reference to the store also ends it.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return false;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let store = Arc::downgrade(self);
        let interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(
                                removed = removed,
                                remaining = store.len(),
                                "Swept expired counters"
                            );
                        }
                    }
                }
            }

            debug!("Local counter sweep exited");
        });

        *slot = Some(SweepTask { shutdown, handle });
        info!(interval = ?interval, "Local counter sweep started");
        true
    }

    /// Stop the background sweep and wait for it to exit.
    ///
    /// Returns `false` if no sweep was running.
    pub async fn stop(&self) -> bool {
        let task = self.sweeper.lock().take();
        let Some(task) = task else {
            return false;
        };

        // The task may already be gone if it observed the store being dropped
        let _ = task.shutdown.send(());
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Local counter sweep ended abnormally");
        }

        info!("Local counter sweep stopped");
        true
    }

    /// Whether the background sweep is running.
    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(ExpiryMode::default(), DEFAULT_SWEEP_INTERVAL)
    }
}

#[async_trait]
impl CounterStore for LocalStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord, StoreError> {
        Ok(self.increment_at(key, window, Utc::now()))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    const WINDOW: Duration = Duration::from_millis(1000);

    #[tokio::test]
    async fn test_increment_counts_hits() {
        let store = LocalStore::default();

        let first = assert_ok!(store.increment("api:10.0.0.1", WINDOW).await);
        let second = assert_ok!(store.increment("api:10.0.0.1", WINDOW).await);

        assert_eq!(first.hits, 1);
        assert_eq!(second.hits, 2);
        assert_eq!(first.reset_at, second.reset_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = LocalStore::default();

        store.increment("api:a", WINDOW).await.unwrap();
        store.increment("api:a", WINDOW).await.unwrap();
        let other = store.increment("api:b", WINDOW).await.unwrap();

        assert_eq!(other.hits, 1);
        assert_eq!(store.get("api:a").unwrap().hits, 2);
    }

    #[test]
    fn test_window_rollover_restarts_count() {
        let store = LocalStore::default();
        let start = Utc::now();

        for _ in 0..5 {
            store.increment_at("k", WINDOW, start);
        }
        assert_eq!(store.get("k").unwrap().hits, 5);

        let later = start + chrono::Duration::milliseconds(1100);
        let record = store.increment_at("k", WINDOW, later);

        assert_eq!(record.hits, 1);
        assert_eq!(record.reset_at, later + chrono::Duration::milliseconds(1000));
    }

    #[test]
    fn test_sliding_store_keeps_busy_key_alive() {
        let store = LocalStore::new(ExpiryMode::Sliding, DEFAULT_SWEEP_INTERVAL);
        let start = Utc::now();

        // A hit every 600ms never lets a 1s window lapse
        for step in 0..5 {
            store.increment_at("k", WINDOW, start + chrono::Duration::milliseconds(600 * step));
        }

        assert_eq!(store.get("k").unwrap().hits, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(LocalStore::default());
        let tasks = 32;
        let per_task = 50;

        let mut handles = Vec::new();
        for _ in 0..tasks {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::with_capacity(per_task);
                for _ in 0..per_task {
                    let record = store.increment("auth:shared", Duration::from_secs(60)).await.unwrap();
                    seen.push(record.hits);
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for hits in handle.await.unwrap() {
                assert!(all.insert(hits), "hit count {} observed twice", hits);
            }
        }

        let total = (tasks * per_task) as u64;
        assert_eq!(store.get("auth:shared").unwrap().hits, total);
        assert_eq!(all, (1..=total).collect::<HashSet<_>>());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = LocalStore::default();
        let now = Utc::now();

        store.increment_at("old", WINDOW, now - chrono::Duration::seconds(5));
        store.increment_at("fresh", WINDOW, now);

        assert_eq!(store.sweep_at(now), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[tokio::test]
    async fn test_reset_clears_key() {
        let store = LocalStore::default();
        store.increment("k", WINDOW).await.unwrap();

        assert_ok!(store.reset("k").await);
        assert!(store.is_empty());

        let record = store.increment("k", WINDOW).await.unwrap();
        assert_eq!(record.hits, 1);
    }

    #[tokio::test]
    async fn test_sweep_lifecycle() {
        let store = Arc::new(LocalStore::new(ExpiryMode::Fixed, Duration::from_millis(20)));

        assert!(store.start());
        assert!(!store.start(), "second start must be a no-op");
        assert!(store.is_running());

        store.increment("short", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.is_empty(), "sweep should have removed the lapsed record");

        assert!(store.stop().await);
        assert!(!store.stop().await);
        assert!(!store.is_running());

        // Nothing sweeps once stopped
        store.increment("short", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.len(), 1);
    }
}
