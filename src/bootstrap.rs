use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};
use crate::{
    api::handler::AppState,
    config::{Config, StoreBackend},
    error::{AppError, AppResult},
    locale::LocaleCatalog,
    push::HttpPushSender,
    reconciler::{FineReconciler, ReconcileScheduler, ReconcilerSettings},
    store::{memory::MemorySeed, postgres::attempts_limit, InMemoryStore, PgRecordStore, RecordStore},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let store = initialize_store(config).await?;
    info!("✅ Record store ready ({})", store.name());

    let locales = Arc::new(LocaleCatalog::embedded(&config.default_language)?);
    info!(
        "🌍 Locale tables loaded: {} (fallback: {})",
        locales.languages().join(", "),
        config.default_language
    );

    if config.push_server_url.is_none() {
        warn!("⚠️  PUSH_SERVER_URL not set - push notifications will fail");
    }
    let push = Arc::new(HttpPushSender::new(
        config.push_server_url.clone(),
        config.push_timeout(),
    )?);
    info!("✅ Push sender initialized");

    let settings = ReconcilerSettings {
        max_candidate_attempts: config.max_candidate_attempts,
        lease_ttl: config.lease_ttl(),
    };
    let reconciler = Arc::new(FineReconciler::new(store, push, locales, settings));
    info!("✅ Fine reconciler initialized (instance {})", reconciler.instance_id());

    let scheduler = Arc::new(
        ReconcileScheduler::new(reconciler, config.reconcile_interval())
            .with_session_limits(config.session_ttl(), config.max_sessions),
    );
    info!(
        "✅ Sessions expire after {:?} without a heartbeat (max {})",
        config.session_ttl(),
        config.max_sessions
    );

    if config.sweep_all_senders {
        scheduler.start_sweep();
        info!("✅ Sender sweep started (every {:?})", config.reconcile_interval());
    }

    Ok(AppState { scheduler })
}

async fn initialize_store(config: &Config) -> AppResult<Arc<dyn RecordStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            attempts_limit(config.max_candidate_attempts)?;
            let pool = initialize_database(&config.database_url).await?;
            Ok(Arc::new(PgRecordStore::new(pool)))
        }
        StoreBackend::Memory => {
            let seed = match &config.memory_seed_path {
                Some(path) => {
                    info!("🧪 Loading memory store seed from {}", path);
                    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                        AppError::Config(format!("cannot read seed file {}: {}", path, e))
                    })?;
                    serde_json::from_str::<MemorySeed>(&raw)?
                }
                None => MemorySeed::default(),
            };
            Ok(Arc::new(InMemoryStore::seeded(seed).await))
        }
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
