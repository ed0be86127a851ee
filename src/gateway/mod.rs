pub mod handlers;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::{HeliosError, Result};
use crate::limiter::{LimiterManager, Mode};
use crate::metrics::DecisionMetrics;
use crate::registry::PolicySnapshot;
use crate::store::RedisStore;

/// Shared state behind the decision surface
pub struct AppState {
    pub snapshot: Arc<PolicySnapshot>,
    pub manager: Arc<LimiterManager>,
    pub store: Option<Arc<RedisStore>>,
    pub metrics: Arc<dyn DecisionMetrics>,
    pub default_mode: Mode,
    pub service_version: String,
    pub admit_timeout: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/allow", get(handlers::handle_allow))
        .route("/api/v1/quota/{tenant}", get(handlers::handle_quota))
        // Back-compat alias
        .route("/allow", get(handlers::handle_allow))
        .route("/health", get(handlers::handle_health))
        .route("/ready", get(handlers::handle_ready))
        .route("/metrics", get(handlers::handle_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the decision surface until the shutdown future resolves
pub async fn serve(
    address: &str,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| HeliosError::Configuration(format!("failed to bind {address}: {e}")))?;

    info!("Gateway listening on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| HeliosError::Internal(format!("server error: {e}")))
}
