//! # Signalink Gateway
//!
//! Real-time fan-out and presence gateway for the Signalink chat product.
//!
//! This is the application entry point that initializes:
//! - Tracing/logging subsystem
//! - Configuration loading
//! - Database connection pool
//! - Redis pub/sub backbone
//! - HTTP/WebSocket server

use anyhow::Result;
use tracing::info;

use signalink_gateway::config::Settings;
use signalink_gateway::startup::Application;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for structured logging
    signalink_gateway::telemetry::init_tracing();

    info!("Starting Signalink Gateway...");

    // Load configuration from environment and config files
    let settings = Settings::load()?;
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        environment = %settings.environment,
        "Configuration loaded"
    );

    // Build and run the application
    let application = Application::build(settings).await?;

    info!("Gateway ready to accept connections");
    application.run_until_stopped().await?;

    Ok(())
}
