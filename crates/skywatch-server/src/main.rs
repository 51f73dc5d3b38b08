//! SkyWatch Server - telemetry alert rules and safety event escalation

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skywatch_server::config::Config;
use skywatch_server::state::AppState;
use skywatch_server::{api, loops, persistence};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skywatch_server=debug".parse()?),
        )
        .init();

    tracing::info!("Starting SkyWatch Server...");

    let config = Config::from_env();
    let port = config.server_port;

    let db = persistence::init_database(&config.database_path, config.database_max_connections)
        .await?;
    let state = Arc::new(AppState::with_database(db, config));
    state.load_preferences().await?;

    // Start background loops
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let loop_handles = vec![
        tokio::spawn(loops::feed_loop::run_feed_loop(state.clone(), shutdown_tx.subscribe())),
        tokio::spawn(loops::safety_loop::run_safety_loop(state.clone(), shutdown_tx.subscribe())),
        tokio::spawn(loops::rule_loop::run_rule_loop(state.clone(), shutdown_tx.subscribe())),
    ];

    let app = api::routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", err);
            }
            tracing::info!("Shutting down background loops");
            let _ = signal_tx.send(());
        })
        .await?;

    // Covers the server stopping on its own
    let _ = shutdown_tx.send(());
    futures::future::join_all(loop_handles).await;

    Ok(())
}
