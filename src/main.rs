mod error;
mod api;
mod badges;
mod fines;
mod locale;
mod push;
mod reconciler;
mod store;
mod templating;
mod server;
mod bootstrap;
mod middleware;
mod config;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::info;
use anyhow::Context;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,fines_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before reading RUST_LOG
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting Fine Reconciliation Backend");

    let config = config::Config::from_env().context("invalid configuration")?;

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("failed to initialize application state")?;
    let scheduler = state.scheduler.clone();

    // Create HTTP server
    let app = server::create_app(state, &config);

    // Run the Server
    server::run_server(app, &config.bind_address).await?;

    scheduler.shutdown_all();
    info!("👋 Server stopped");

    Ok(())
}
