use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::errors::{HeliosError, Result};
use crate::limiter::{AdmitContext, Decision, Mode};
use crate::registry::valid_tenant_id;
use crate::store::SharedStore;

use super::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AllowParams {
    pub tenant: Option<String>,
    pub resource: Option<String>,
    pub api_key: Option<String>,
    pub cost: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuotaParams {
    pub resource: Option<String>,
    pub api_key: Option<String>,
}

/// Decision surface: validate, authenticate, dispatch, shape the envelope.
pub async fn handle_allow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AllowParams>,
) -> Result<Response> {
    let tenant = require_tenant(&headers, params.tenant)?;
    let api_key = require_api_key(&headers, params.api_key)?;
    let resource = params.resource.unwrap_or_else(|| "default".to_string());
    let cost = parse_cost(params.cost.as_deref())?;

    let entry = state
        .snapshot
        .lookup(&tenant)
        .ok_or_else(|| HeliosError::TenantNotFound(tenant.clone()))?;
    if !entry.record.permits_key(&api_key) {
        return Err(HeliosError::Forbidden);
    }

    let engine = state.manager.get(&tenant, &resource)?;
    let key = decision_key(&tenant, &resource, &api_key);
    let ctx = AdmitContext::with_deadline(tokio::time::Instant::now() + state.admit_timeout);

    state.metrics.inc_total();
    let started = std::time::Instant::now();
    let decision = engine.limiter.admit(&ctx, &key, cost).await?;
    state
        .metrics
        .observe_latency(started.elapsed().as_secs_f64());

    if decision.allowed {
        state.metrics.inc_allowed();
    } else {
        state.metrics.inc_denied();
    }
    crate::metrics::record_tenant_request(&tenant, decision.allowed);
    if let Some(keys) = engine.limiter.tracked_keys() {
        crate::metrics::record_tracked_keys(&tenant, &resource, keys);
    }

    debug!(
        %tenant,
        %resource,
        cost,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "admit decided"
    );

    Ok(decision_response(&decision, engine.mode))
}

/// Read-only quota surface: same fields, nothing charged.
pub async fn handle_quota(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Query(params): Query<QuotaParams>,
) -> Result<Response> {
    if !valid_tenant_id(&tenant) {
        return Err(HeliosError::InvalidRequest(format!(
            "invalid tenant: {tenant:?}"
        )));
    }
    let api_key = require_api_key(&headers, params.api_key)?;
    let resource = params.resource.unwrap_or_else(|| "default".to_string());

    let entry = state
        .snapshot
        .lookup(&tenant)
        .ok_or_else(|| HeliosError::TenantNotFound(tenant.clone()))?;
    if !entry.record.permits_key(&api_key) {
        return Err(HeliosError::Forbidden);
    }

    let engine = state.manager.get(&tenant, &resource)?;
    let key = decision_key(&tenant, &resource, &api_key);
    let ctx = AdmitContext::with_deadline(tokio::time::Instant::now() + state.admit_timeout);

    let decision = engine.limiter.quota(&ctx, &key).await?;

    let response = (
        StatusCode::OK,
        rate_limit_headers(&decision, engine.mode),
        Json(json!({
            "remaining": decision.remaining,
            "limit": decision.limit,
            "reset_time": decision.reset_at,
        })),
    );
    Ok(response.into_response())
}

/// Overall plus per-collaborator health
pub async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let mut status = "healthy";
    let mut checks = BTreeMap::new();

    if let Some(store) = &state.store {
        match store.ping().await {
            Ok(()) => {
                checks.insert("redis", "healthy".to_string());
            }
            Err(e) => {
                status = "unhealthy";
                checks.insert("redis", format!("error: {e}"));
            }
        }
        let pool = store.pool_stats();
        checks.insert(
            "redis_pool",
            format!("{}/{} connections available", pool.available, pool.max_size),
        );
    }

    if state.snapshot.is_fresh() {
        checks.insert("registry", "healthy".to_string());
    } else {
        status = "unhealthy";
        checks.insert("registry", "stale".to_string());
    }

    checks.insert("limiter", "healthy".to_string());

    Json(json!({
        "status": status,
        "version": state.service_version,
        "checks": checks,
    }))
    .into_response()
}

/// Readiness: stale policy beyond the budget or a failing store ping (strong
/// mode) pulls the node out of rotation.
pub async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    let mut reasons: Vec<&str> = Vec::new();

    if !state.snapshot.is_fresh() {
        reasons.push("registry snapshot stale beyond budget");
    }

    if state.default_mode == Mode::Strong {
        match &state.store {
            Some(store) if store.healthy() => {}
            Some(_) => reasons.push("shared store ping failing"),
            None => reasons.push("shared store not configured"),
        }
    }

    if reasons.is_empty() {
        Json(json!({ "ready": true })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "reasons": reasons })),
        )
            .into_response()
    }
}

/// Prometheus text exposition
pub async fn handle_metrics() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| HeliosError::Internal(format!("failed to encode metrics: {e}")))?;

    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    );
    Ok(response.into_response())
}

/// The unit of isolation: all three components, never tenant alone.
pub fn decision_key(tenant: &str, resource: &str, api_key: &str) -> String {
    format!("{tenant}:{resource}:{api_key}")
}

fn require_tenant(headers: &HeaderMap, query: Option<String>) -> Result<String> {
    let tenant = header_value(headers, "x-tenant-id")
        .or(query)
        .ok_or_else(|| HeliosError::InvalidRequest("tenant parameter is required".to_string()))?;

    if !valid_tenant_id(&tenant) {
        return Err(HeliosError::InvalidRequest(format!(
            "invalid tenant: {tenant:?}"
        )));
    }
    Ok(tenant)
}

fn require_api_key(headers: &HeaderMap, query: Option<String>) -> Result<String> {
    header_value(headers, "x-api-key")
        .or(query)
        .ok_or(HeliosError::Unauthenticated)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn parse_cost(raw: Option<&str>) -> Result<i64> {
    match raw {
        None => Ok(1),
        Some(s) => match s.parse::<i64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(HeliosError::InvalidRequest(
                "invalid cost parameter".to_string(),
            )),
        },
    }
}

fn rate_limit_headers(decision: &Decision, mode: Mode) -> [(&'static str, String); 4] {
    [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_string()),
        ("x-helios-mode", mode.as_str().to_string()),
    ]
}

fn decision_response(decision: &Decision, mode: Mode) -> Response {
    let headers = rate_limit_headers(decision, mode);

    if decision.allowed {
        (
            StatusCode::OK,
            headers,
            Json(json!({
                "allowed": true,
                "remaining": decision.remaining,
                "limit": decision.limit,
                "reset_time": decision.reset_at,
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            headers,
            [("retry-after", decision.retry_after_s.to_string())],
            Json(json!({
                "allowed": false,
                "error": "rate limit exceeded",
                "retry_after_seconds": decision.retry_after_s,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LimiterManager;
    use crate::metrics::testing::CountingMetrics;
    use crate::registry::tests_support::record_named;
    use crate::registry::PolicySnapshot;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn state_with(
        snapshot: Arc<PolicySnapshot>,
        metrics: Arc<CountingMetrics>,
    ) -> Arc<AppState> {
        let manager = Arc::new(LimiterManager::new(Arc::clone(&snapshot), None));
        Arc::new(AppState {
            snapshot,
            manager,
            store: None,
            metrics,
            default_mode: Mode::Fast,
            service_version: "test".to_string(),
            admit_timeout: Duration::from_secs(5),
        })
    }

    fn fresh_state() -> (Arc<AppState>, Arc<CountingMetrics>) {
        let snapshot = Arc::new(PolicySnapshot::new(Duration::from_secs(30)));
        snapshot.apply_put(record_named("acme"), 1);
        let metrics = Arc::new(CountingMetrics::default());
        (state_with(snapshot, Arc::clone(&metrics)), metrics)
    }

    fn allow_params(tenant: &str, api_key: &str) -> AllowParams {
        AllowParams {
            tenant: Some(tenant.to_string()),
            api_key: Some(api_key.to_string()),
            ..Default::default()
        }
    }

    async fn allow(state: &Arc<AppState>, params: AllowParams) -> Response {
        handle_allow(State(Arc::clone(state)), HeaderMap::new(), Query(params))
            .await
            .into_response()
    }

    #[test]
    fn test_decision_key_has_three_components() {
        assert_eq!(decision_key("t", "r", "k"), "t:r:k");
        assert_ne!(
            decision_key("t", "a", "k"),
            decision_key("t", "b", "k"),
            "resources must not share a bucket"
        );
        assert_ne!(
            decision_key("t", "r", "k1"),
            decision_key("t", "r", "k2"),
            "credentials must not share a bucket"
        );
    }

    #[test]
    fn test_parse_cost() {
        assert_eq!(parse_cost(None).unwrap(), 1);
        assert_eq!(parse_cost(Some("7")).unwrap(), 7);
        assert!(parse_cost(Some("0")).is_err());
        assert!(parse_cost(Some("-2")).is_err());
        assert!(parse_cost(Some("1.5")).is_err());
        assert!(parse_cost(Some("lots")).is_err());
    }

    #[test]
    fn test_header_overrides_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "from-header".parse().unwrap());
        let key = require_api_key(&headers, Some("from-query".to_string())).unwrap();
        assert_eq!(key, "from-header");
    }

    #[tokio::test]
    async fn test_missing_tenant_is_bad_request() {
        let (state, _) = fresh_state();
        let response = allow(
            &state,
            AllowParams {
                api_key: Some("test-key".to_string()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_tenant_is_bad_request() {
        let (state, _) = fresh_state();
        let response = allow(&state, allow_params("no spaces allowed", "test-key")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_unauthenticated() {
        let (state, _) = fresh_state();
        let response = allow(
            &state,
            AllowParams {
                tenant: Some("acme".to_string()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_api_key_is_forbidden() {
        let (state, _) = fresh_state();
        let response = allow(&state, allow_params("acme", "stolen-key")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_not_found() {
        let (state, _) = fresh_state();
        let response = allow(&state, allow_params("ghost", "test-key")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_allowed_admit_shapes_envelope() {
        let (state, metrics) = fresh_state();
        let response = allow(&state, allow_params("acme", "test-key")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "119");
        assert_eq!(headers.get("x-helios-mode").unwrap(), "fast");
        assert!(headers.contains_key("x-ratelimit-reset"));

        assert_eq!(metrics.total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.allowed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.denied.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_denied_admit_carries_retry_after() {
        let (state, metrics) = fresh_state();

        // Default policy: burst 120. Drain it, then overflow.
        let mut params = allow_params("acme", "test-key");
        params.cost = Some("120".to_string());
        assert_eq!(allow(&state, params).await.status(), StatusCode::OK);

        let response = allow(&state, allow_params("acme", "test-key")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));

        assert_eq!(metrics.denied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let snapshot = Arc::new(PolicySnapshot::new(Duration::from_secs(30)));
        snapshot.apply_put(record_named("tenant-a"), 1);
        snapshot.apply_put(record_named("tenant-b"), 2);
        let metrics = Arc::new(CountingMetrics::default());
        let state = state_with(snapshot, metrics);

        // Exhaust tenant A.
        let mut params = allow_params("tenant-a", "test-key");
        params.cost = Some("120".to_string());
        assert_eq!(allow(&state, params).await.status(), StatusCode::OK);
        assert_eq!(
            allow(&state, allow_params("tenant-a", "test-key"))
                .await
                .status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        // Tenant B is untouched.
        let response = allow(&state, allow_params("tenant-b", "test-key")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "119"
        );
    }

    #[tokio::test]
    async fn test_quota_does_not_charge() {
        let (state, _) = fresh_state();

        let quota = handle_quota(
            State(Arc::clone(&state)),
            Path("acme".to_string()),
            HeaderMap::new(),
            Query(QuotaParams {
                api_key: Some("test-key".to_string()),
                ..Default::default()
            }),
        )
        .await
        .into_response();
        assert_eq!(quota.status(), StatusCode::OK);
        assert_eq!(quota.headers().get("x-ratelimit-remaining").unwrap(), "120");

        // Still at full budget afterwards.
        let response = allow(&state, allow_params("acme", "test-key")).await;
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "119"
        );
    }

    #[tokio::test]
    async fn test_ready_reflects_stale_snapshot() {
        let snapshot = Arc::new(PolicySnapshot::new(Duration::from_secs(30)));
        let metrics = Arc::new(CountingMetrics::default());
        let state = state_with(snapshot, metrics);

        // Never synced: not ready.
        let response = handle_ready(State(Arc::clone(&state))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.snapshot.stamp_synced();
        let response = handle_ready(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
