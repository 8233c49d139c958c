//! Session Broker
//!
//! Stateful WebSocket signaling server for real-time multi-party media
//! sessions.
//!
//! # Servers
//!
//! One HTTP listener carries everything:
//! - `GET /ws` - WebSocket signaling endpoint (one connection per peer)
//! - `GET /health`, `GET /ready` - Kubernetes probes
//! - `GET /metrics` - Prometheus metrics
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment (validated, fail-fast)
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the media engine instances and build the engine pool
//! 4. Start the actor system (`BrokerActorHandle`)
//! 5. Bind the listener and start serving
//! 6. Wait for shutdown signal; cancel the actor tree and drain

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use session_broker::actors::BrokerActorHandle;
use session_broker::config::Config;
use session_broker::engine::loopback::LoopbackEngine;
use session_broker::engine::{EnginePool, MediaEngine};
use session_broker::observability::HealthState;
use session_broker::server::{app_router, AppState};
use signal_protocol::codecs;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_broker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Session Broker");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        engine_worker_count = config.engine_worker_count,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        announced_ip = %config.announced_ip,
        max_peers_per_room = config.max_peers_per_room,
        max_producers_per_peer = config.max_producers_per_peer,
        max_consumers_per_peer = config.max_consumers_per_peer,
        room_idle_timeout_seconds = config.room_idle_timeout_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;
    info!("Prometheus metrics recorder initialized");

    // Validate the codec table before handing it to any router
    let router_codecs = config.codec_profile.codecs();
    codecs::validate(&router_codecs).map_err(|e| {
        error!(error = %e, "Invalid codec configuration");
        format!("Invalid codec configuration: {e}")
    })?;
    info!(
        codec_count = router_codecs.len(),
        profile = ?config.codec_profile,
        "Codec profile selected"
    );

    // Spawn media engine instances and build the pool
    let engines: Vec<Arc<dyn MediaEngine>> = (0..config.engine_worker_count)
        .map(|index| Arc::new(LoopbackEngine::new(index)) as Arc<dyn MediaEngine>)
        .collect();
    let engine_pool = Arc::new(EnginePool::new(engines).map_err(|e| {
        error!(error = %e, "Failed to build engine pool");
        format!("Failed to build engine pool: {e}")
    })?);
    info!(instances = engine_pool.len(), "Engine pool ready");

    // Initialize actor system
    let broker = BrokerActorHandle::new(
        config.limits(),
        config.listen_config(),
        config.room_idle_timeout(),
        config.room_sweep_interval(),
    );
    info!("Actor system initialized");

    let shutdown_token = broker.child_token();
    let health_state = Arc::new(HealthState::new());

    // Assemble the HTTP surface: signaling + health + metrics
    let state = Arc::new(AppState {
        broker: broker.clone(),
        engines: engine_pool,
        router_codecs,
    });

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    let app = app_router(state, Arc::clone(&health_state))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind before serving to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind listener");
            format!("Failed to bind {}: {e}", config.bind_address)
        })?;
    info!(addr = %config.bind_address, "Listener bound successfully");

    let serve_token = shutdown_token.child_token();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            serve_token.cancelled().await;
            info!("Server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Server failed");
        }
    });

    health_state.set_ready();
    info!("Session Broker running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    // Cancel the actor tree (rooms close their routers) and the server
    broker.cancel();

    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Server task failed during shutdown"),
        Err(_) => warn!("Server shutdown timed out"),
    }

    info!("Session Broker shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
