mod common;

use axum::extract::State;
use axum::Json;
use common::{author_with_books, setup};
use unit_of_work::admin::{
    clear_stats_handler, evict_cache_handler, health_handler, stats_handler, EvictRequest,
};
use unit_of_work::AppError;

#[tokio::test]
async fn test_health_lists_mapped_entities() {
    let db = setup().await;
    let Json(body) = health_handler(State(db.factory.clone())).await.unwrap();
    assert_eq!(body["status"], "healthy");
    let entities = body["entities"].as_array().unwrap();
    assert!(entities.iter().any(|e| e == "Author"));
    assert!(entities.iter().any(|e| e == "Book"));
}

#[tokio::test]
async fn test_stats_report_and_clear() {
    let db = setup().await;
    let author = author_with_books("Becky Chambers", &["Record of a Spaceborn Few"]);
    let mut session = db.factory.open_session().await.unwrap();
    session.begin_transaction().await.unwrap();
    session.persist(&author).await.unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();

    let Json(stats) = stats_handler(State(db.factory.clone())).await.unwrap();
    assert_eq!(stats.statistics.entity_inserts, 2);
    assert_eq!(stats.cache_regions.get("Author"), Some(&1));

    clear_stats_handler(State(db.factory.clone())).await.unwrap();
    let Json(stats) = stats_handler(State(db.factory.clone())).await.unwrap();
    assert_eq!(stats.statistics.entity_inserts, 0);
}

#[tokio::test]
async fn test_evict_cache_by_entity_and_everything() {
    let db = setup().await;
    let author = author_with_books("Adrian Tchaikovsky", &[]);
    let mut session = db.factory.open_session().await.unwrap();
    session.begin_transaction().await.unwrap();
    session.persist(&author).await.unwrap();
    session.commit().await.unwrap();

    let request = EvictRequest {
        entity: Some("Author".to_string()),
    };
    let Json(body) = evict_cache_handler(State(db.factory.clone()), Some(Json(request)))
        .await
        .unwrap();
    assert_eq!(body["regions_evicted"], 1);
    assert_eq!(db.factory.cache_sizes().await.get("Author"), Some(&0));

    let Json(body) = evict_cache_handler(State(db.factory.clone()), None).await.unwrap();
    assert!(body["entity"].is_null());

    let unknown = EvictRequest {
        entity: Some("Starship".to_string()),
    };
    let result = evict_cache_handler(State(db.factory.clone()), Some(Json(unknown))).await;
    assert!(matches!(result, Err(AppError::InvalidArgument(_))));
}
