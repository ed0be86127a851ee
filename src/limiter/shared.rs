use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{HeliosError, Result};
use crate::limiter::{AdmitContext, Decision, LimitConfig, Limiter};
use crate::store::{SharedStore, StoreDecision};

/// Strong-mode token bucket: every admit is one atomic round-trip to the
/// shared store. No local caching of decisions — cluster-wide linearizability
/// per decision key comes from the store's scripted execution.
pub struct SharedTokenBucket {
    cfg: LimitConfig,
    store: Arc<dyn SharedStore>,
}

impl SharedTokenBucket {
    pub fn new(cfg: LimitConfig, store: Arc<dyn SharedStore>) -> Self {
        Self { cfg, store }
    }
}

#[async_trait]
impl Limiter for SharedTokenBucket {
    async fn admit(&self, ctx: &AdmitContext, key: &str, cost: i64) -> Result<Decision> {
        if cost < 0 {
            return Err(HeliosError::InvalidRequest(format!(
                "cost must be non-negative, got {cost}"
            )));
        }
        if ctx.expired() {
            return Err(HeliosError::Cancelled);
        }

        let call = self.store.token_bucket_admit(
            key,
            self.cfg.limit,
            self.cfg.window_secs(),
            cost,
            self.cfg.burst,
        );
        let outcome = await_within(ctx, call).await?;
        Ok(to_decision(outcome, self.cfg.limit))
    }

    async fn quota(&self, ctx: &AdmitContext, key: &str) -> Result<Decision> {
        if ctx.expired() {
            return Err(HeliosError::Cancelled);
        }

        let call =
            self.store
                .token_bucket_quota(key, self.cfg.limit, self.cfg.window_secs(), self.cfg.burst);
        let outcome = await_within(ctx, call).await?;
        Ok(to_decision(outcome, self.cfg.limit))
    }
}

/// Strong-mode sliding window over the store's sorted-set script
pub struct SharedSlidingWindow {
    cfg: LimitConfig,
    store: Arc<dyn SharedStore>,
}

impl SharedSlidingWindow {
    pub fn new(cfg: LimitConfig, store: Arc<dyn SharedStore>) -> Self {
        Self { cfg, store }
    }
}

#[async_trait]
impl Limiter for SharedSlidingWindow {
    async fn admit(&self, ctx: &AdmitContext, key: &str, cost: i64) -> Result<Decision> {
        if cost < 0 {
            return Err(HeliosError::InvalidRequest(format!(
                "cost must be non-negative, got {cost}"
            )));
        }
        if ctx.expired() {
            return Err(HeliosError::Cancelled);
        }

        let call =
            self.store
                .sliding_window_admit(key, self.cfg.limit, self.cfg.window_secs(), cost);
        let outcome = await_within(ctx, call).await?;
        Ok(to_decision(outcome, self.cfg.limit))
    }

    async fn quota(&self, ctx: &AdmitContext, key: &str) -> Result<Decision> {
        if ctx.expired() {
            return Err(HeliosError::Cancelled);
        }

        let call = self
            .store
            .sliding_window_quota(key, self.cfg.limit, self.cfg.window_secs());
        let outcome = await_within(ctx, call).await?;
        Ok(to_decision(outcome, self.cfg.limit))
    }
}

/// Run a store call under the context deadline. A trip after the script may
/// have executed still reports `Cancelled`; the charge is treated as spent.
async fn await_within<F>(ctx: &AdmitContext, call: F) -> Result<StoreDecision>
where
    F: std::future::Future<Output = Result<StoreDecision>>,
{
    match ctx.deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(HeliosError::Cancelled),
        },
        None => call.await,
    }
}

fn to_decision(outcome: StoreDecision, limit: i64) -> Decision {
    Decision {
        allowed: outcome.allowed,
        remaining: outcome.remaining,
        limit,
        reset_at: outcome.reset_at_ms / 1000,
        retry_after_s: outcome.retry_after_s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Store fake that either fails every call or returns a canned outcome
    struct FakeStore {
        outcome: Option<StoreDecision>,
        calls: AtomicU64,
    }

    impl FakeStore {
        fn unavailable() -> Self {
            Self {
                outcome: None,
                calls: AtomicU64::new(0),
            }
        }

        fn returning(outcome: StoreDecision) -> Self {
            Self {
                outcome: Some(outcome),
                calls: AtomicU64::new(0),
            }
        }

        fn respond(&self) -> Result<StoreDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
                .ok_or_else(|| HeliosError::StoreUnavailable("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl SharedStore for FakeStore {
        async fn token_bucket_admit(
            &self,
            _key: &str,
            _limit: i64,
            _window_secs: i64,
            _cost: i64,
            _burst: i64,
        ) -> Result<StoreDecision> {
            self.respond()
        }

        async fn token_bucket_quota(
            &self,
            _key: &str,
            _limit: i64,
            _window_secs: i64,
            _burst: i64,
        ) -> Result<StoreDecision> {
            self.respond()
        }

        async fn sliding_window_admit(
            &self,
            _key: &str,
            _limit: i64,
            _window_secs: i64,
            _cost: i64,
        ) -> Result<StoreDecision> {
            self.respond()
        }

        async fn sliding_window_quota(
            &self,
            _key: &str,
            _limit: i64,
            _window_secs: i64,
        ) -> Result<StoreDecision> {
            self.respond()
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn cfg() -> LimitConfig {
        LimitConfig::new(10, Duration::from_secs(60), 12)
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let store = Arc::new(FakeStore::unavailable());
        let limiter = SharedTokenBucket::new(cfg(), store.clone());

        let result = limiter.admit(&AdmitContext::default(), "k", 1).await;
        assert!(matches!(result, Err(HeliosError::StoreUnavailable(_))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_admit_maps_store_outcome() {
        let store = Arc::new(FakeStore::returning(StoreDecision {
            allowed: false,
            remaining: 0,
            reset_at_ms: 1_700_000_012_000,
            retry_after_s: 12,
        }));
        let limiter = SharedTokenBucket::new(cfg(), store);

        let d = limiter
            .admit(&AdmitContext::default(), "k", 1)
            .await
            .unwrap();
        assert!(!d.allowed);
        assert_eq!(d.limit, 10);
        assert_eq!(d.reset_at, 1_700_000_012);
        assert_eq!(d.retry_after_s, 12);
    }

    #[tokio::test]
    async fn test_sliding_window_delegates() {
        let store = Arc::new(FakeStore::returning(StoreDecision {
            allowed: true,
            remaining: 9,
            reset_at_ms: 1_700_000_060_000,
            retry_after_s: 0,
        }));
        let limiter = SharedSlidingWindow::new(cfg(), store.clone());

        let d = limiter
            .admit(&AdmitContext::default(), "k", 1)
            .await
            .unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 9);

        limiter.quota(&AdmitContext::default(), "k").await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_context_skips_store_call() {
        let store = Arc::new(FakeStore::unavailable());
        let limiter = SharedTokenBucket::new(cfg(), store.clone());
        let ctx = AdmitContext::with_deadline(tokio::time::Instant::now());

        let result = limiter.admit(&ctx, "k", 1).await;
        assert!(matches!(result, Err(HeliosError::Cancelled)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_negative_cost_rejected_without_store_call() {
        let store = Arc::new(FakeStore::unavailable());
        let limiter = SharedSlidingWindow::new(cfg(), store.clone());

        let result = limiter.admit(&AdmitContext::default(), "k", -1).await;
        assert!(matches!(result, Err(HeliosError::InvalidRequest(_))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }
}
