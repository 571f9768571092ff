//! Bull Monitor Server
//!
//! Discovers BullMQ queues in Redis and keeps a live inventory of them, exports
//! per-queue job metrics, and serves probes, the queue list and Prometheus
//! metrics over HTTP.
//!
//! Configuration comes from `config.toml` (or `BULL_MONITOR_CONFIG`) with
//! environment overrides such as `REDIS_HOST`, `BULL_WATCH_QUEUE_PREFIXES`
//! and `PORT`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bm_api::{create_router, AppState};
use bm_config::ConfigLoader;
use bm_discovery::redis_store::{RedisAdminConnection, RedisHandleFactory, RedisNotificationConnection};
use bm_discovery::DiscoveryEngine;
use bm_metrics::{CollectorSettings, QueueMetricsCollector};
use tokio::{net::TcpListener, signal, sync::oneshot};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    bm_common::logging::init_logging("bull-monitor");

    let config = ConfigLoader::new().load()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        redis = %config.redis.redacted_url(),
        prefixes = ?config.discovery.watch_prefixes,
        "Starting Bull Monitor"
    );

    // 1. Metrics recorder
    let prometheus = if config.metrics.enabled {
        Some(bm_metrics::install_recorder(config.metrics.series_idle_timeout())?)
    } else {
        info!("Metrics disabled");
        None
    };

    // 2. Redis connections and the discovery engine
    let (admin, admin_events) = RedisAdminConnection::new(&config.redis)?;
    let (notifications, notification_events) = RedisNotificationConnection::new(&config.redis)?;
    let factory = Arc::new(RedisHandleFactory::new(
        admin.clone(),
        &config.redis,
        config.discovery.support_keepalive(),
    ));

    let engine = DiscoveryEngine::new(
        &config.discovery,
        config.redis.db,
        admin.clone(),
        notifications.clone(),
        factory,
    );

    // 3. Job metrics collector, subscribed before any queue can be discovered
    let collector = config.metrics.enabled.then(|| {
        let collector = QueueMetricsCollector::new(
            engine.registry().clone(),
            CollectorSettings {
                interval: config.metrics.collect_interval(),
                job_events: config.metrics.job_events,
                event_block: config.metrics.event_block(),
            },
        );
        collector.start(engine.subscribe());
        collector
    });

    engine.start(admin_events, notification_events)?;
    admin.start();
    notifications.start();

    // 4. HTTP API
    let mut state = AppState::new(engine.registry().clone(), engine.subscribe_status());
    if let Some(collector) = &collector {
        state = state.with_collector(collector.clone());
    }
    if let Some(handle) = prometheus {
        state = state.with_prometheus(handle);
    }

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Starting HTTP API server");

    let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = server_shutdown_rx.await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "HTTP server error");
        }
    });

    info!("Bull Monitor started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Graceful shutdown: stop serving, then tear down discovery
    let _ = server_shutdown_tx.send(());
    if let Some(collector) = &collector {
        collector.shutdown().await;
    }
    engine.shutdown().await;

    if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server_task).await.is_err() {
        warn!("HTTP server did not stop within {:?}", SERVER_SHUTDOWN_TIMEOUT);
    }

    info!("Bull Monitor shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
