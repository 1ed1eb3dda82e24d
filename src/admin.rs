// Admin interface - health, statistics and cache management over HTTP
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use crate::engine::SessionFactory;
use crate::error::AppError;
use crate::infrastructure::StatisticsSnapshot;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub statistics: StatisticsSnapshot,
    pub cache_regions: HashMap<String, usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EvictRequest {
    /// Entity whose region is emptied; every region when absent
    pub entity: Option<String>,
}

pub async fn health_handler(State(factory): State<SessionFactory>) -> Result<Json<Value>, AppError> {
    factory.health_check().await?;
    Ok(Json(json!({
        "status": "healthy",
        "entities": factory.metamodel().entity_names(),
    })))
}

pub async fn stats_handler(State(factory): State<SessionFactory>) -> Result<Json<StatsResponse>, AppError> {
    Ok(Json(StatsResponse {
        statistics: factory.statistics(),
        cache_regions: factory.cache_sizes().await,
    }))
}

pub async fn clear_stats_handler(State(factory): State<SessionFactory>) -> Result<Json<Value>, AppError> {
    factory.clear_statistics();
    info!("Statistics cleared");
    Ok(Json(json!({ "cleared": true })))
}

pub async fn evict_cache_handler(
    State(factory): State<SessionFactory>,
    request: Option<Json<EvictRequest>>,
) -> Result<Json<Value>, AppError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let evicted = factory.evict_cache(request.entity.as_deref()).await?;
    Ok(Json(json!({
        "entity": request.entity,
        "regions_evicted": evicted,
    })))
}

pub fn create_admin_router(factory: SessionFactory) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/stats/clear", post(clear_stats_handler))
        .route("/cache/evict", post(evict_cache_handler))
        .with_state(factory)
}
