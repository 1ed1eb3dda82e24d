// Unit-of-work admin server - seeds the library model and serves engine statistics
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use unit_of_work::{
    admin::create_admin_router,
    config::Config,
    data_seeder::seed_library,
    domains::library_metamodel,
    infrastructure::{LruRegionFactory, SqliteConnectionProvider},
    SessionFactory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let provider = SqliteConnectionProvider::connect(&config.database.url, config.database.max_connections).await?;
    let factory = SessionFactory::builder(library_metamodel()?, Arc::new(provider))
        .config(config.session_factory_config()?)
        .region_factory(Arc::new(LruRegionFactory::new(config.cache.capacity)))
        .build()
        .await?;

    seed_library(&factory).await?;

    let app = Router::new()
        .nest("/api/v1/admin", create_admin_router(factory))
        .layer(CorsLayer::permissive());

    let addr = config.server_address();
    info!("Admin server starting on http://{}", addr);
    info!("  GET  /api/v1/admin/health       - Database health");
    info!("  GET  /api/v1/admin/stats        - Session factory statistics");
    info!("  POST /api/v1/admin/stats/clear  - Reset statistics");
    info!("  POST /api/v1/admin/cache/evict  - Evict second-level cache regions");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
