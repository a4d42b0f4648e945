pub mod cli;
pub mod config;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::websocket::RelayState;

/// Assemble the relay router. Tests pass `None` for metrics since the
/// Prometheus recorder is process-global.
pub fn build_router(state: RelayState, metrics: Option<PrometheusHandle>) -> Router {
    let ws_routes = Router::new()
        .route("/mac", get(websocket::mac_handler))
        .route("/browser", get(websocket::browser_handler))
        .with_state(state.clone());

    let http_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .with_state(state);

    let mut app = Router::new().merge(ws_routes).merge(http_routes);
    if let Some(handle) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(handlers::metrics_handler))
                .with_state(handle),
        );
    }
    // unknown paths fall through to the router's 404
    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Run the relay until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let prometheus = install_metrics_recorder();
    let registry = Arc::new(SessionRegistry::new(config.session_code_expiry));
    tokio::spawn(registry::run_sweeper(
        registry.clone(),
        config.sweep_interval,
    ));

    let state = RelayState {
        registry: registry.clone(),
        config: Arc::new(config.clone()),
    };
    let app = build_router(state, Some(prometheus));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("relay listening on {addr}");

    // the shutdown future also asks every live connection to close, so the
    // graceful wait is bounded by the handshake and write timeouts
    let graceful = axum::serve(listener, app).with_graceful_shutdown({
        let registry = registry.clone();
        async move {
            shutdown_signal().await;
            let closing = registry.close_all();
            info!(closing, "shutdown signal received; draining connections");
        }
    });
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_ms = config.shutdown_grace.as_millis() as u64,
        "sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
