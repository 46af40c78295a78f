mod api;
mod config;
mod error;
mod gateway;
mod rooms;
mod services;
mod state;
mod types;

use std::sync::Arc;

use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::rooms::RoomStore;
use crate::services::arbitrator::{Arbitrator, GeminiOracle};
use crate::services::audio::{AudioService, LyriaConnector};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config; a missing GEMINI_API_KEY fails here.
    let config = AppConfig::load()?;
    tracing::info!("Starting CrowdSynth server");

    // Build application state
    let rooms = Arc::new(RoomStore::new());
    let arbitrator = Arc::new(Arbitrator::new(Arc::new(GeminiOracle::new(
        config.gemini_api_key.clone(),
    ))));
    let audio = Arc::new(AudioService::new(
        Arc::new(LyriaConnector::new(config.gemini_api_key.clone())),
        rooms.clone(),
    ));
    let state = AppState {
        rooms,
        arbitrator,
        audio,
    };

    // Build router
    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.frontend_url)?)
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn cors_layer(frontend_url: &str) -> anyhow::Result<CorsLayer> {
    if frontend_url == "*" {
        return Ok(CorsLayer::permissive());
    }
    // A pinned origin still gets a localhost override for development.
    let origins: Vec<HeaderValue> = vec![
        frontend_url.parse()?,
        "http://localhost:5173".parse()?,
    ];
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutting down...");
}
