// Pocket Ledger - Web Server
// REST API with Axum

use anyhow::{Context, Result};
use clap::Parser;
use pocket_ledger::api::{build_router, AppState};
use pocket_ledger::config::ServerConfig;
use pocket_ledger::db::open_database;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::parse();

    // Open database (created on first run)
    let conn = open_database(&config.database)
        .with_context(|| format!("Failed to open database {}", config.database))?;
    info!(database = %config.database, "database opened");

    let app = build_router(AppState::new(conn), &config).context("Failed to build router")?;

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;

    info!(
        bind = %config.bind,
        cors_origin = %config.cors_origin,
        "🚀 server running, API under /api"
    );

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
