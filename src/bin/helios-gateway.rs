use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use helios::config::{self, validator::validate_config, Config};
use helios::gateway::{self, AppState};
use helios::limiter::{LimiterManager, Mode};
use helios::metrics::PrometheusMetrics;
use helios::registry::{watch, PolicyRegistry, PolicySnapshot};
use helios::store::{pool::create_redis_pool, RedisStore, SharedStore};

/// Interval between shared-store liveness pings in strong mode
const STORE_PING_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "helios={},tower_http=info",
                    config.observability.log_level
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Helios Gateway (version: {}, consistency mode: {})",
        config.observability.service_version,
        config.gateway.consistency_mode.as_str()
    );

    validate_config(&config)?;
    config::log_summary(&config);

    // Shared store. Construction is lazy; an unreachable store degrades
    // strong-mode admits instead of failing the process.
    let pool = create_redis_pool(&config.redis)?;
    let store = Arc::new(RedisStore::new(pool, &config.redis));
    store.warm_up().await;

    // Policy registry: local snapshot fed by the etcd prefix watch.
    let etcd = PolicyRegistry::connect(&config.etcd).await?;
    let snapshot = Arc::new(PolicySnapshot::new(config.etcd.staleness_budget));
    let watcher = watch::spawn(etcd, Arc::clone(&snapshot));

    let manager = Arc::new(LimiterManager::new(
        Arc::clone(&snapshot),
        Some(Arc::clone(&store) as Arc<dyn SharedStore>),
    ));

    // In strong mode the readiness surface tracks consecutive ping failures.
    if config.gateway.consistency_mode == Mode::Strong {
        let ping_store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STORE_PING_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = ping_store.ping().await {
                    warn!(error = %e, "shared store liveness ping failed");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        snapshot,
        manager,
        store: Some(store),
        metrics: Arc::new(PrometheusMetrics),
        default_mode: config.gateway.consistency_mode,
        service_version: config.observability.service_version.clone(),
        admit_timeout: config.gateway.admit_timeout,
    });

    gateway::serve(&config.gateway.address, state, shutdown_signal()).await?;

    watcher.abort();
    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
