//! Core rate limiter implementation.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, trace};

use super::counter::CounterRecord;
use super::profile::LimiterProfile;
use crate::error::Result;
use crate::pipeline::{Admission, RateLimitHeaders, RequestContext};
use crate::store::CounterStore;

/// Outcome of counting one request against a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request is within the limit
    pub allowed: bool,
    /// Configured maximum
    pub limit: u64,
    /// Hits in the current window, this request included
    pub hits: u64,
    /// `max(0, limit - hits)`
    pub remaining: u64,
    /// When the window lapses
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until the window lapses, set only when denied
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// Decide from a counter record.
    pub fn from_record(record: &CounterRecord, limit: u64, now: DateTime<Utc>) -> Self {
        let allowed = record.hits <= limit;
        Self {
            allowed,
            limit,
            hits: record.hits,
            remaining: limit.saturating_sub(record.hits),
            reset_at: record.reset_at,
            retry_after_secs: (!allowed).then(|| record.retry_after_secs(now)),
        }
    }
}

/// What the limiter concluded about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The profile's skip rule matched; nothing was counted.
    Skipped,
    /// The request was counted.
    Checked(Decision),
    /// The limiter itself failed; the request is let through.
    FailedOpen,
}

impl Verdict {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        match self {
            Verdict::Skipped | Verdict::FailedOpen => true,
            Verdict::Checked(decision) => decision.allowed,
        }
    }

    /// The decision, if the request was counted.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Verdict::Checked(decision) => Some(decision),
            _ => None,
        }
    }
}

/// A rate limiter bound to one profile.
///
/// The limiter never fails a request: store outages are absorbed by the
/// tiered store, and anything else that goes wrong inside it is logged and
/// resolved by letting the request through.
pub struct RateLimiter {
    /// The profile this limiter enforces
    profile: LimiterProfile,
    /// Counter store, shared with the other profiles of the process
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Create a new rate limiter for a profile.
    pub fn new(profile: LimiterProfile, store: Arc<dyn CounterStore>) -> Self {
        Self { profile, store }
    }

    /// The profile this limiter enforces.
    pub fn profile(&self) -> &LimiterProfile {
        &self.profile
    }

    /// Count the request and decide.
    pub async fn check(&self, request: &dyn RequestContext) -> Verdict {
        match AssertUnwindSafe(self.evaluate(request)).catch_unwind().await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                error!(
                    profile = %self.profile.name(),
                    error = %e,
                    "Rate limiter fault, failing open"
                );
                Verdict::FailedOpen
            }
            Err(panic) => {
                error!(
                    profile = %self.profile.name(),
                    panic = %panic_message(panic.as_ref()),
                    "Rate limiter panicked, failing open"
                );
                Verdict::FailedOpen
            }
        }
    }

    async fn evaluate(&self, request: &dyn RequestContext) -> Result<Verdict> {
        let policy = self.profile.policy();

        if policy.should_skip(request) {
            trace!(profile = %self.profile.name(), path = %request.path(), "Skipping rate limit");
            return Ok(Verdict::Skipped);
        }

        let key = self.profile.bucket_key(policy.derive_key(request)?);
        let record = self
            .store
            .increment(&key.to_store_key(), self.profile.window())
            .await?;
        let decision = Decision::from_record(&record, self.profile.max(), Utc::now());

        trace!(
            key = %key,
            hits = decision.hits,
            remaining = decision.remaining,
            "Checked rate limit"
        );

        if !decision.allowed {
            debug!(
                key = %key,
                hits = decision.hits,
                limit = decision.limit,
                retry_after = ?decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }

        Ok(Verdict::Checked(decision))
    }

    /// Check the request and tell the host what to do with it.
    ///
    /// Checked requests always carry the `X-RateLimit-*` headers; skipped and
    /// failed-open requests carry none.
    #[instrument(skip(self, request), fields(profile = %self.profile.name()))]
    pub async fn admit(&self, request: &dyn RequestContext) -> Admission {
        let decision = match self.check(request).await {
            Verdict::Skipped | Verdict::FailedOpen => return Admission::pass(),
            Verdict::Checked(decision) => decision,
        };

        let headers = RateLimitHeaders::from_decision(&decision).to_pairs();
        if decision.allowed {
            return Admission::Proceed { headers };
        }

        let policy = self.profile.policy();
        let handled = std::panic::catch_unwind(AssertUnwindSafe(|| {
            policy.on_exceeded(request, &decision, self.profile.message())
        }));

        match handled {
            Ok(mut rejection) => {
                for (name, value) in headers {
                    if rejection.header(&name).is_none() {
                        rejection.headers.push((name, value));
                    }
                }
                Admission::Reject(rejection)
            }
            Err(panic) => {
                error!(
                    profile = %self.profile.name(),
                    panic = %panic_message(panic.as_ref()),
                    "Limit exceeded handler panicked, failing open"
                );
                Admission::pass()
            }
        }
    }

    /// Clear the bucket the request maps to.
    pub async fn reset(&self, request: &dyn RequestContext) -> Result<()> {
        let scope = self.profile.policy().derive_key(request)?;
        self.reset_scope(&scope).await
    }

    /// Clear the bucket for an already-derived scope.
    pub async fn reset_scope(&self, scope: &str) -> Result<()> {
        let key = self.profile.bucket_key(scope);
        self.store.reset(&key.to_store_key()).await?;
        info!(key = %key, "Rate limit bucket reset");
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;
    use crate::pipeline::{ClientRequest, Rejection};
    use crate::ratelimit::{KeyStrategy, LimitPolicy, ProfileConfig, StandardPolicy};
    use crate::store::{LocalStore, StoreError, TieredStore};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::time::Duration;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn local_store() -> (Arc<LocalStore>, Arc<dyn CounterStore>) {
        let local = Arc::new(LocalStore::default());
        let store: Arc<dyn CounterStore> = Arc::new(TieredStore::local_only(local.clone()));
        (local, store)
    }

    fn limiter_with(policy: Arc<dyn LimitPolicy>, max: u64, window_ms: u64) -> (Arc<LocalStore>, RateLimiter) {
        let (local, store) = local_store();
        let profile = LimiterProfile::new("test", Duration::from_millis(window_ms), max, policy);
        (local, RateLimiter::new(profile, store))
    }

    fn address_limiter(max: u64, window_ms: u64) -> (Arc<LocalStore>, RateLimiter) {
        limiter_with(Arc::new(StandardPolicy::new(KeyStrategy::ClientAddress)), max, window_ms)
    }

    #[tokio::test]
    async fn test_basic_enforcement() {
        let (_, limiter) = address_limiter(5, 1000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        for i in 1..=5 {
            let verdict = limiter.check(&request).await;
            let decision = verdict.decision().unwrap();
            assert!(decision.allowed, "request {} should be allowed", i);
            assert_eq!(decision.hits, i);
            assert_eq!(decision.remaining, 5 - i);
        }

        let verdict = limiter.check(&request).await;
        let decision = verdict.decision().unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        let retry_after = decision.retry_after_secs.unwrap();
        assert!(retry_after <= 1);
    }

    #[tokio::test]
    async fn test_window_rollover() {
        let (_, limiter) = address_limiter(5, 1000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        for _ in 0..6 {
            limiter.check(&request).await;
        }
        assert!(!limiter.check(&request).await.is_allowed());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let verdict = limiter.check(&request).await;
        let decision = verdict.decision().unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.hits, 1);
    }

    #[tokio::test]
    async fn test_remaining_never_negative() {
        let (_, limiter) = address_limiter(2, 60_000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        for _ in 0..10 {
            let verdict = limiter.check(&request).await;
            let decision = verdict.decision().unwrap();
            assert_eq!(decision.remaining, decision.limit.saturating_sub(decision.hits));
        }
    }

    #[tokio::test]
    async fn test_auth_key_composition() {
        let (local, store) = local_store();
        let profile = ProfileConfig::auth().build();
        let limiter = RateLimiter::new(profile, store);

        let attacker = ClientRequest::new(addr("203.0.113.7")).with_field("email", "a@x.com");
        for _ in 0..5 {
            assert!(limiter.admit(&attacker).await.is_allowed());
        }
        let blocked = limiter.admit(&attacker).await;
        assert_eq!(blocked.status(), Some(429));

        // Same address, different account: separate budget
        let neighbour = ClientRequest::new(addr("203.0.113.7")).with_field("email", "b@x.com");
        let admission = limiter.admit(&neighbour).await;
        assert!(admission.is_allowed());
        assert_eq!(admission.header("X-RateLimit-Remaining"), Some("4"));

        assert_eq!(local.get("auth:203.0.113.7|a@x.com").unwrap().hits, 6);
        assert_eq!(local.get("auth:203.0.113.7|b@x.com").unwrap().hits, 1);
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _key: &str, _window: Duration) -> std::result::Result<CounterRecord, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(100)))
        }

        async fn reset(&self, _key: &str) -> std::result::Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(100)))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_degraded_mode_still_enforces() {
        let local = Arc::new(LocalStore::default());
        let store: Arc<dyn CounterStore> =
            Arc::new(TieredStore::new(Some(Arc::new(DownStore)), local.clone()));
        let profile = LimiterProfile::new(
            "api",
            Duration::from_secs(60),
            3,
            Arc::new(StandardPolicy::new(KeyStrategy::ClientAddress)),
        );
        let limiter = RateLimiter::new(profile, store);
        let request = ClientRequest::new(addr("10.0.0.9"));

        let mut allowed = 0;
        for _ in 0..10 {
            let admission = limiter.admit(&request).await;
            match admission.status() {
                None => allowed += 1,
                Some(status) => assert_eq!(status, 429),
            }
        }

        assert_eq!(allowed, 3);
        assert_eq!(local.get("api:10.0.0.9").unwrap().hits, 10);
    }

    #[tokio::test]
    async fn test_skip_does_not_count() {
        let policy = StandardPolicy::new(KeyStrategy::ClientAddress).with_skip(crate::ratelimit::SkipRule {
            addresses: vec![addr("127.0.0.1")],
            path_prefixes: vec!["/health".to_string()],
        });
        let (local, limiter) = limiter_with(Arc::new(policy), 1, 60_000);

        for _ in 0..5 {
            let request = ClientRequest::new(addr("127.0.0.1"));
            assert_eq!(limiter.check(&request).await, Verdict::Skipped);

            let request = ClientRequest::new(addr("10.0.0.1")).with_path("/health");
            let admission = limiter.admit(&request).await;
            assert!(admission.is_allowed());
            assert!(admission.headers().is_empty());
        }

        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_headers_on_every_checked_request() {
        let (_, limiter) = address_limiter(1, 60_000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        let first = limiter.admit(&request).await;
        assert_eq!(first.header("X-RateLimit-Limit"), Some("1"));
        assert_eq!(first.header("X-RateLimit-Remaining"), Some("0"));
        assert!(first.header("X-RateLimit-Reset").is_some());

        let second = limiter.admit(&request).await;
        let Admission::Reject(rejection) = second else {
            panic!("second request should be rejected");
        };
        assert_eq!(rejection.header("X-RateLimit-Remaining"), Some("0"));
        let body = rejection.body.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["message"], crate::ratelimit::DEFAULT_MESSAGE);
        assert!(body["error"]["retryAfter"].as_u64().unwrap() <= 60);
    }

    struct PanickingPolicy;

    impl LimitPolicy for PanickingPolicy {
        fn derive_key(&self, _request: &dyn RequestContext) -> Result<String> {
            panic!("bug in key derivation");
        }
    }

    #[tokio::test]
    async fn test_internal_fault_fails_open() {
        let (local, limiter) = limiter_with(Arc::new(PanickingPolicy), 1, 60_000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        for _ in 0..3 {
            assert_eq!(limiter.check(&request).await, Verdict::FailedOpen);
            assert_eq!(limiter.admit(&request).await, Admission::pass());
        }
        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_missing_address_fails_open() {
        let (_, limiter) = address_limiter(1, 60_000);
        let request = ClientRequest::anonymous();

        for _ in 0..3 {
            assert_eq!(limiter.check(&request).await, Verdict::FailedOpen);
        }
    }

    struct RedirectPolicy;

    impl LimitPolicy for RedirectPolicy {
        fn derive_key(&self, request: &dyn RequestContext) -> Result<String> {
            KeyStrategy::ClientAddress.derive(request)
        }

        fn on_exceeded(&self, _request: &dyn RequestContext, _decision: &Decision, _message: &str) -> Rejection {
            Rejection::new(303)
                .with_header("Location", "/login?locked=1")
                .with_body(serde_json::json!({ "locked": true }))
        }
    }

    #[tokio::test]
    async fn test_custom_exceeded_handler() {
        let (_, limiter) = limiter_with(Arc::new(RedirectPolicy), 1, 60_000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        limiter.admit(&request).await;
        let admission = limiter.admit(&request).await;

        assert_eq!(admission.status(), Some(303));
        assert_eq!(admission.header("Location"), Some("/login?locked=1"));
        assert_eq!(admission.header("X-RateLimit-Limit"), Some("1"));

        let Admission::Reject(rejection) = admission else {
            panic!("expected a rejection");
        };
        assert_eq!(rejection.body.unwrap()["locked"], true);
    }

    struct PanickingHandler;

    impl LimitPolicy for PanickingHandler {
        fn derive_key(&self, request: &dyn RequestContext) -> Result<String> {
            KeyStrategy::ClientAddress.derive(request)
        }

        fn on_exceeded(&self, _request: &dyn RequestContext, _decision: &Decision, _message: &str) -> Rejection {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_open() {
        let (_, limiter) = limiter_with(Arc::new(PanickingHandler), 1, 60_000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        limiter.admit(&request).await;
        assert!(limiter.admit(&request).await.is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_caps_at_max() {
        let (_, limiter) = address_limiter(10, 60_000);
        let limiter = Arc::new(limiter);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let request = ClientRequest::new("10.0.0.1".parse().unwrap());
                limiter.check(&request).await
            }));
        }

        let mut allowed = 0;
        let mut hits = Vec::new();
        for handle in handles {
            let verdict = handle.await.unwrap();
            if verdict.is_allowed() {
                allowed += 1;
            }
            hits.push(verdict.decision().unwrap().hits);
        }

        hits.sort_unstable();
        assert_eq!(allowed, 10);
        assert_eq!(hits, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reset_restores_budget() {
        let (_, limiter) = address_limiter(1, 60_000);
        let request = ClientRequest::new(addr("10.0.0.1"));

        limiter.check(&request).await;
        assert!(!limiter.check(&request).await.is_allowed());

        limiter.reset(&request).await.unwrap();
        assert!(limiter.check(&request).await.is_allowed());
    }

    #[tokio::test]
    async fn test_reset_requires_a_key() {
        let (_, limiter) = address_limiter(1, 60_000);
        let result = limiter.reset(&ClientRequest::anonymous()).await;
        assert!(matches!(result, Err(TurnstileError::KeyDerivation(_))));
    }
}
