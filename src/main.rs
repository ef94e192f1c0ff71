use anyhow::Result;
use std::sync::Arc;

use taskmarket_backend::config::{Settings, StoreBackend};
use taskmarket_backend::store::{
    ChangeHub, ChangeStream, MemoryObjectStorage, MemoryStore, ObjectStorage, PgChangeFeed,
    PgStore, ReadRetry, RetryPolicy, Store, SupabaseStorage,
};
use taskmarket_backend::{app, db, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;

    logging::init_logging(&settings);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        store_backend = ?settings.store_backend,
        "Starting taskmarket backend"
    );

    let retry = RetryPolicy {
        max_elapsed: settings.read_retry_max_elapsed,
        ..RetryPolicy::default()
    };

    let (store, changes): (Arc<dyn Store>, Arc<dyn ChangeStream>) = match settings.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&settings).await?;
            if settings.run_migrations {
                db::run_migrations(&pool).await?;
            }
            let hub = ChangeHub::new();
            PgChangeFeed::spawn(&pool, hub.clone()).await?;
            let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
            let changes: Arc<dyn ChangeStream> = Arc::new(hub);
            (store, changes)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; data is lost on restart");
            let memory = Arc::new(MemoryStore::new());
            let store: Arc<dyn Store> = memory.clone();
            let changes: Arc<dyn ChangeStream> = memory;
            (store, changes)
        }
    };
    let store: Arc<dyn Store> = Arc::new(ReadRetry::new(store, retry));

    let objects: Arc<dyn ObjectStorage> = match &settings.storage_url {
        Some(url) => Arc::new(SupabaseStorage::new(
            url.as_str(),
            &settings.storage_service_key,
            settings.storage_timeout_seconds,
        )?),
        None => {
            tracing::warn!("STORAGE_URL not set; uploads are kept in memory");
            Arc::new(MemoryObjectStorage::new())
        }
    };

    let state = app::AppState::new(store, changes, objects, settings.clone());
    let app = app::create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
