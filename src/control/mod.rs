use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::{HeliosError, Result};
use crate::registry::{valid_tenant_id, PolicyRegistry, TenantPatch, TenantRecord};

/// Shared state behind the control plane
pub struct ControlState {
    pub registry: PolicyRegistry,
    pub service_version: String,
}

pub fn router(state: Arc<ControlState>) -> axum::Router {
    axum::Router::new()
        .route(
            "/api/v1/tenants",
            get(list_tenants).post(create_tenant),
        )
        .route(
            "/api/v1/tenants/{tenant_id}",
            get(get_tenant).put(update_tenant).delete(delete_tenant),
        )
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control plane until the shutdown future resolves
pub async fn serve(
    address: &str,
    state: Arc<ControlState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| HeliosError::Configuration(format!("failed to bind {address}: {e}")))?;

    info!("Control plane listening on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| HeliosError::Internal(format!("server error: {e}")))
}

async fn create_tenant(
    State(state): State<Arc<ControlState>>,
    Json(record): Json<TenantRecord>,
) -> Result<Response> {
    let created = state.registry.create(record).await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_tenant(
    State(state): State<Arc<ControlState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantRecord>> {
    require_valid_id(&tenant_id)?;
    Ok(Json(state.registry.get(&tenant_id).await?))
}

async fn update_tenant(
    State(state): State<Arc<ControlState>>,
    Path(tenant_id): Path<String>,
    Json(patch): Json<TenantPatch>,
) -> Result<Json<TenantRecord>> {
    require_valid_id(&tenant_id)?;
    Ok(Json(state.registry.update(&tenant_id, patch).await?))
}

async fn delete_tenant(
    State(state): State<Arc<ControlState>>,
    Path(tenant_id): Path<String>,
) -> Result<StatusCode> {
    require_valid_id(&tenant_id)?;
    state.registry.delete(&tenant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tenants(State(state): State<Arc<ControlState>>) -> Result<Response> {
    let tenants = state.registry.list().await?;
    let response = Json(json!({
        "count": tenants.len(),
        "tenants": tenants,
    }));
    Ok(response.into_response())
}

async fn handle_health(State(state): State<Arc<ControlState>>) -> Response {
    match state.registry.health().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "service": "helios-control",
            "version": state.service_version,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "control-plane health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "error": "etcd connectivity issue",
                })),
            )
                .into_response()
        }
    }
}

fn require_valid_id(tenant_id: &str) -> Result<()> {
    if !valid_tenant_id(tenant_id) {
        return Err(HeliosError::InvalidRequest(format!(
            "invalid tenant id: {tenant_id:?}"
        )));
    }
    Ok(())
}
