mod cli;
mod config;
mod handlers;
mod registry;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    cli::Cli,
    config::Config,
    handlers::{create_room, health_check, room_status, AppState},
    registry::RoomRegistry,
    ws::{websocket_handler, CoordinatorState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN unless RUST_LOG says otherwise.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);

    info!("Starting skiff-harbor coordinator on port {}", config.port);
    info!("Room TTL: {} seconds", config.room_ttl_seconds);

    let registry = Arc::new(RoomRegistry::new(
        config.room_ttl_seconds,
        config.max_code_attempts,
    ));

    // Expiry is enforced on lookup as well; the sweep keeps notifications
    // timely and the map small.
    let sweeper = registry.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_seconds.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            sweeper.sweep_expired(Utc::now());
        }
    });

    let app_state = AppState {
        registry: registry.clone(),
        room_ttl_seconds: config.room_ttl_seconds,
    };
    let http_routes = Router::new()
        .route("/health", get(health_check))
        .route("/rooms", post(create_room))
        .route("/rooms/:code", get(room_status))
        .with_state(app_state);

    let ws_routes = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(CoordinatorState { registry });

    let app = Router::new()
        .merge(http_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("skiff-harbor listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
