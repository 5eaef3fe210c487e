mod handlers;
mod routes;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use redis::aio::ConnectionManager;
use sentinel_common::registry::LanguageRegistry;
use sentinel_common::settings::Settings;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Request bodies above this are rejected before they reach a handler.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub registry: LanguageRegistry,
    pub settings: Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Sentinel dispatcher booting...");

    let settings = Settings::from_env();

    let registry = LanguageRegistry::load(&settings.language_config_dir).map_err(|e| {
        error!(dir = %settings.language_config_dir, error = %e, "failed to load language descriptors");
        e
    })?;
    info!("Supported languages: {:?}", registry.names());

    let client = redis::Client::open(settings.redis_url().as_str())
        .context("failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;
    info!("Connected to Redis: {}", settings.redis_url());

    let addr = format!("0.0.0.0:{}", settings.port);
    let state = Arc::new(AppState {
        redis: redis_conn,
        registry,
        settings,
    });

    // The ingress owns rate limiting and security headers; the service
    // itself only enforces the body cap and permissive CORS.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::routes())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!("HTTP server listening on {}", addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
