use axum::{
    middleware::from_fn,
    routing::{get, post},
    Extension, Router,
};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;
use crate::{
    api::handler::{
        end_session, get_user_badges, health_check, start_session, trigger_reconcile, AppState,
    },
    config::Config,
    middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer},
};

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let limiter = RateLimitLayer::per_minute(config.rate_limit_per_minute);

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))

        .nest("/api/v1",
            Router::new()
                // Session lifecycle
                .route("/sessions/:user_id", post(start_session).delete(end_session))

                // Ad-hoc reconciliation
                .route("/reconcile/:user_id", post(trigger_reconcile))

                // Profile
                .route("/users/:user_id/badges", get(get_user_badges))

                .layer(
                    ServiceBuilder::new()
                        .layer(Extension(limiter))
                        .layer(from_fn(rate_limit_middleware)),
                )
        )
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(&config.cors_origins()))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown signal received");
}
