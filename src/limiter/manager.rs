use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::errors::{HeliosError, Result};
use crate::limiter::shared::{SharedSlidingWindow, SharedTokenBucket};
use crate::limiter::{
    Algorithm, Limiter, Mode, SlidingWindowLimiter, TokenBucketLimiter,
};
use crate::registry::{PolicySnapshot, ResolvedPolicy};
use crate::store::SharedStore;

/// Engine plus the policy facts the gateway needs for response shaping
pub struct ResolvedEngine {
    pub limiter: Arc<dyn Limiter>,
    pub mode: Mode,
}

struct CachedEngine {
    /// Registry revision the engine was built from
    revision: i64,
    policy: ResolvedPolicy,
    limiter: Arc<dyn Limiter>,
}

/// Resolves the engine for a `(tenant, resource)` pair under the currently
/// effective policy.
///
/// Engines are cached per pair together with the registry revision they were
/// built from; a policy update shows up as a revision bump and the next admit
/// constructs a fresh engine. State in the replaced engine is dropped, not
/// migrated — semantics differ across algorithms and the transient
/// over/under-admit is bounded by the new window.
pub struct LimiterManager {
    snapshot: Arc<PolicySnapshot>,
    store: Option<Arc<dyn SharedStore>>,
    engines: DashMap<(String, String), CachedEngine>,
}

impl LimiterManager {
    pub fn new(snapshot: Arc<PolicySnapshot>, store: Option<Arc<dyn SharedStore>>) -> Self {
        Self {
            snapshot,
            store,
            engines: DashMap::new(),
        }
    }

    pub fn get(&self, tenant: &str, resource: &str) -> Result<ResolvedEngine> {
        let Some(entry) = self.snapshot.lookup(tenant) else {
            // A deleted tenant also invalidates its cached engines.
            self.invalidate_tenant(tenant);
            return Err(HeliosError::TenantNotFound(tenant.to_string()));
        };

        let policy = entry.record.policy_for(resource);
        let cache_key = (tenant.to_string(), resource.to_string());

        if let Some(cached) = self.engines.get(&cache_key) {
            if cached.revision == entry.revision {
                return Ok(ResolvedEngine {
                    limiter: Arc::clone(&cached.limiter),
                    mode: cached.policy.mode,
                });
            }
        }

        let limiter = self.build_engine(&policy)?;
        debug!(
            tenant,
            resource,
            revision = entry.revision,
            algorithm = policy.algorithm.as_str(),
            mode = policy.mode.as_str(),
            "engine constructed"
        );

        self.engines.insert(
            cache_key,
            CachedEngine {
                revision: entry.revision,
                policy,
                limiter: Arc::clone(&limiter),
            },
        );

        Ok(ResolvedEngine {
            limiter,
            mode: policy.mode,
        })
    }

    fn build_engine(&self, policy: &ResolvedPolicy) -> Result<Arc<dyn Limiter>> {
        let engine: Arc<dyn Limiter> = match policy.mode {
            Mode::Fast => match policy.algorithm {
                Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(policy.limits)),
                Algorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(policy.limits)),
            },
            Mode::Strong => {
                let store = self.store.clone().ok_or_else(|| {
                    HeliosError::StoreUnavailable("shared store not configured".to_string())
                })?;
                match policy.algorithm {
                    Algorithm::TokenBucket => {
                        Arc::new(SharedTokenBucket::new(policy.limits, store))
                    }
                    Algorithm::SlidingWindow => {
                        Arc::new(SharedSlidingWindow::new(policy.limits, store))
                    }
                }
            }
        };
        Ok(engine)
    }

    fn invalidate_tenant(&self, tenant: &str) {
        self.engines.retain(|(t, _), _| t != tenant);
    }

    /// Number of cached engines, for the health surface
    pub fn cached_engines(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::AdmitContext;
    use crate::registry::tests_support::record_named;
    use crate::registry::{LimitPolicy, PolicySnapshot};
    use std::time::Duration;

    fn snapshot() -> Arc<PolicySnapshot> {
        Arc::new(PolicySnapshot::new(Duration::from_secs(30)))
    }

    #[test]
    fn test_unknown_tenant_is_not_found() {
        let manager = LimiterManager::new(snapshot(), None);
        assert!(matches!(
            manager.get("ghost", "default"),
            Err(HeliosError::TenantNotFound(_))
        ));
    }

    #[test]
    fn test_engine_cached_per_revision() {
        let snap = snapshot();
        snap.apply_put(record_named("acme"), 3);

        let manager = LimiterManager::new(Arc::clone(&snap), None);
        let first = manager.get("acme", "default").unwrap();
        let second = manager.get("acme", "default").unwrap();
        assert!(Arc::ptr_eq(&first.limiter, &second.limiter));
        assert_eq!(manager.cached_engines(), 1);
    }

    #[tokio::test]
    async fn test_policy_update_rebuilds_engine_with_fresh_state() {
        let snap = snapshot();
        let mut record = record_named("acme");
        record.limits.insert(
            "default".to_string(),
            LimitPolicy {
                limit: 5,
                window_secs: 60,
                burst: 5,
                algorithm: None,
                mode: None,
            },
        );
        snap.apply_put(record.clone(), 1);

        let manager = LimiterManager::new(Arc::clone(&snap), None);
        let engine = manager.get("acme", "default").unwrap();

        // Exhaust the old budget.
        let ctx = AdmitContext::default();
        for _ in 0..5 {
            assert!(engine.limiter.admit(&ctx, "k", 1).await.unwrap().allowed);
        }
        assert!(!engine.limiter.admit(&ctx, "k", 1).await.unwrap().allowed);

        // Raise the limit; the revision bump swaps in a fresh engine.
        record
            .limits
            .insert(
                "default".to_string(),
                LimitPolicy {
                    limit: 50,
                    window_secs: 60,
                    burst: 50,
                    algorithm: None,
                    mode: None,
                },
            );
        snap.apply_put(record, 2);

        let engine = manager.get("acme", "default").unwrap();
        let d = engine.limiter.admit(&ctx, "k", 1).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.limit, 50);
        assert_eq!(d.remaining, 49);
    }

    #[test]
    fn test_strong_mode_without_store_is_degraded() {
        let snap = snapshot();
        let mut record = record_named("acme");
        record.mode = crate::limiter::Mode::Strong;
        snap.apply_put(record, 1);

        let manager = LimiterManager::new(snap, None);
        assert!(matches!(
            manager.get("acme", "default"),
            Err(HeliosError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_tenant_delete_prunes_engines() {
        let snap = snapshot();
        snap.apply_put(record_named("acme"), 1);

        let manager = LimiterManager::new(Arc::clone(&snap), None);
        manager.get("acme", "default").unwrap();
        manager.get("acme", "search").unwrap();
        assert_eq!(manager.cached_engines(), 2);

        snap.apply_delete("acme");
        assert!(manager.get("acme", "default").is_err());
        assert_eq!(manager.cached_engines(), 0);
    }

    #[test]
    fn test_resources_resolve_to_distinct_engines() {
        let snap = snapshot();
        let mut record = record_named("acme");
        record.limits.insert(
            "search".to_string(),
            LimitPolicy {
                limit: 10,
                window_secs: 1,
                burst: 10,
                algorithm: Some(crate::limiter::Algorithm::SlidingWindow),
                mode: None,
            },
        );
        snap.apply_put(record, 1);

        let manager = LimiterManager::new(snap, None);
        let a = manager.get("acme", "default").unwrap();
        let b = manager.get("acme", "search").unwrap();
        assert!(!Arc::ptr_eq(&a.limiter, &b.limiter));
    }
}
