mod common;

use async_trait::async_trait;
use std::sync::Arc;

use common::{author_with_books, setup, setup_with, Currency};
use unit_of_work::domains::library::{Author, Tag};
use unit_of_work::engine::{veto, EntityEvent, EntityListener, ListenerContext, TimestampListener};
use unit_of_work::{AppError, AppResult, EntityRef, EntityStatus, SessionFactoryConfig, Value};

#[tokio::test]
async fn test_persist_commit_and_find_in_new_session() {
    let db = setup().await;
    let author = author_with_books("Ursula K. Le Guin", &["The Dispossessed", "The Lathe of Heaven"]);

    let mut session = db.factory.open_session().await.unwrap();
    session.begin_transaction().await.unwrap();
    session.persist(&author).await.unwrap();
    assert_eq!(session.status_of(&author), Some(EntityStatus::Managed));
    assert!(author.read().id.is_some());
    session.commit().await.unwrap();
    session.close().await.unwrap();
    let id = author.read().id.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    let found = session.find::<Author>(id).await.unwrap().unwrap();
    assert!(!found.ptr_eq(&author));
    assert_eq!(found.read().name, "Ursula K. Le Guin");
    assert_eq!(found.read().books.len(), 2);

    // identity map hands back the same instance
    let again = session.find::<Author>(id).await.unwrap().unwrap();
    assert!(again.ptr_eq(&found));

    let book = found.read().books[0].clone();
    let book_author = book.read().author.clone().unwrap();
    assert!(book_author.ptr_eq(&found));
}

#[tokio::test]
async fn test_find_missing_and_load_missing() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();

    assert!(session.find::<Author>(4242).await.unwrap().is_none());
    let err = session.load::<Author>(4242).await.unwrap_err();
    assert!(matches!(err, AppError::ObjectNotFound(_)));
}

#[tokio::test]
async fn test_detached_instance_cannot_be_persisted() {
    let db = setup().await;
    let author = EntityRef::new(Author::new("Octavia E. Butler"));

    let mut session = db.factory.open_session().await.unwrap();
    session.persist(&author).await.unwrap();
    session.flush().await.unwrap();
    session.close().await.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    let err = session.persist(&author).await.unwrap_err();
    assert!(matches!(err, AppError::PersistentObject(_)));
    assert!(!session.contains(&author));
}

#[tokio::test]
async fn test_detach_drops_pending_changes() {
    let db = setup().await;
    let author = author_with_books("Terry Pratchett", &["Small Gods"]);
    let book = author.read().books[0].clone();

    let mut session = db.factory.open_session().await.unwrap();
    session.persist(&author).await.unwrap();
    session.flush().await.unwrap();
    db.log.clear();

    session.detach(&author).await.unwrap();
    assert!(!session.contains(&author));
    // detach cascades to the books
    assert!(!session.contains(&book));

    author.write().name = "Sir Terry Pratchett".to_string();
    session.flush().await.unwrap();
    assert!(db.log.summary().is_empty());
}

#[tokio::test]
async fn test_remove_then_commit_deletes_row() {
    let db = setup().await;
    let author = EntityRef::new(Author::new("Iain M. Banks"));

    let mut session = db.factory.open_session().await.unwrap();
    session.persist(&author).await.unwrap();
    session.flush().await.unwrap();
    let id = author.read().id.unwrap();

    session.begin_transaction().await.unwrap();
    session.remove(&author).await.unwrap();
    assert_eq!(session.status_of(&author), Some(EntityStatus::Deleted));
    assert!(!session.contains(&author));
    assert!(session.find::<Author>(id).await.unwrap().is_none());
    session.commit().await.unwrap();
    assert_eq!(session.status_of(&author), None);
    session.close().await.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    assert!(session.find::<Author>(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rollback_clears_session() {
    let db = setup().await;
    let author = EntityRef::new(Author::new("Ted Chiang"));

    let mut session = db.factory.open_session().await.unwrap();
    session.begin_transaction().await.unwrap();
    session.persist(&author).await.unwrap();
    session.flush().await.unwrap();
    let id = author.read().id.unwrap();
    session.rollback().await.unwrap();

    assert_eq!(session.entity_count(), 0);
    assert!(!session.is_transaction_active());
    assert!(session.find::<Author>(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_closed_session_rejects_operations() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();
    session.close().await.unwrap();
    assert!(!session.is_open());

    let err = session.persist(&EntityRef::new(Author::new("N. K. Jemisin"))).await.unwrap_err();
    assert!(matches!(err, AppError::SessionClosed));
    assert!(matches!(session.flush().await, Err(AppError::SessionClosed)));

    let stats = db.factory.statistics();
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(stats.sessions_closed, 1);
}

#[tokio::test]
async fn test_commit_without_transaction_fails() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();
    assert!(matches!(session.commit().await, Err(AppError::TransactionError(_))));
}

#[tokio::test]
async fn test_is_dirty_tracks_changes() {
    let db = setup().await;
    let author = EntityRef::new(Author::new("Becky Chambers"));

    let mut session = db.factory.open_session().await.unwrap();
    session.persist(&author).await.unwrap();
    assert!(session.is_dirty().await.unwrap());
    session.flush().await.unwrap();
    assert!(!session.is_dirty().await.unwrap());

    author.write().email = Some("becky@example.org".to_string());
    assert!(session.is_dirty().await.unwrap());
}

#[tokio::test]
async fn test_read_only_instances_are_not_updated() {
    let db = setup().await;
    let author = EntityRef::new(Author::new("Ann Leckie"));
    let mut session = db.factory.open_session().await.unwrap();
    session.persist(&author).await.unwrap();
    session.flush().await.unwrap();
    session.close().await.unwrap();
    let id = author.read().id.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    let loaded = session.load::<Author>(id).await.unwrap();
    session.set_read_only(&loaded, true).unwrap();
    assert!(session.is_read_only(&loaded));
    loaded.write().name = "Changed".to_string();
    db.log.clear();
    session.flush().await.unwrap();
    assert!(db.log.summary().is_empty());

    // switching back takes a fresh snapshot, so earlier edits stay unwritten
    session.set_read_only(&loaded, false).unwrap();
    session.flush().await.unwrap();
    assert!(db.log.summary().is_empty());
    session.close().await.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    session.set_default_read_only(true);
    let again = session.load::<Author>(id).await.unwrap();
    assert!(session.is_read_only(&again));
    assert_eq!(again.read().name, "Ann Leckie");
}

#[tokio::test]
async fn test_refresh_discards_local_changes() {
    let db = setup().await;
    let author = EntityRef::new(Author::new("Ada Palmer"));
    let mut setup_session = db.factory.open_session().await.unwrap();
    setup_session.persist(&author).await.unwrap();
    setup_session.flush().await.unwrap();
    setup_session.close().await.unwrap();
    let id = author.read().id.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    let loaded = session.load::<Author>(id).await.unwrap();

    let mut other = db.factory.open_session().await.unwrap();
    let theirs = other.load::<Author>(id).await.unwrap();
    theirs.write().name = "Ada Palmer (revised)".to_string();
    other.flush().await.unwrap();
    other.close().await.unwrap();

    loaded.write().email = Some("local@example.org".to_string());
    session.refresh(&loaded).await.unwrap();
    assert_eq!(loaded.read().name, "Ada Palmer (revised)");
    assert_eq!(loaded.read().email, None);
    assert_eq!(loaded.read().version, 1);
    assert_eq!(session.version_of(&loaded), Some(1));
    assert!(!session.is_dirty().await.unwrap());

    let stranger = EntityRef::new(Author::new("Not managed"));
    assert!(matches!(
        session.refresh(&stranger).await,
        Err(AppError::InvalidArgument(_))
    ));
}

struct RejectBlankTags;

#[async_trait]
impl EntityListener for RejectBlankTags {
    async fn on_event(&self, ctx: &mut ListenerContext<'_>) -> AppResult<()> {
        match ctx.get("name") {
            Some(Value::Text(name)) if name.trim().is_empty() => veto("tag name is blank"),
            _ => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "reject_blank_tags"
    }

    fn events(&self) -> Vec<EntityEvent> {
        vec![EntityEvent::PreInsert]
    }
}

#[tokio::test]
async fn test_listeners_veto_and_stamp() {
    let db = setup_with(SessionFactoryConfig::default(), |builder| {
        builder
            .listener("Tag", Arc::new(RejectBlankTags))
            .listener("Author", Arc::new(TimestampListener::new("updated_at")))
    })
    .await;

    let mut session = db.factory.open_session().await.unwrap();
    let err = session
        .persist(&EntityRef::new(Tag::new("blank", "  ")))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let author = EntityRef::new(Author::new("Martha Wells"));
    session.persist(&author).await.unwrap();
    assert!(author.read().updated_at.is_some());
}

#[tokio::test]
async fn test_listener_for_unknown_entity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("listeners.db").display());
    let provider = unit_of_work::infrastructure::SqliteConnectionProvider::connect(&url, 1)
        .await
        .unwrap();
    let result = unit_of_work::SessionFactory::builder(common::test_metamodel(), Arc::new(provider))
        .listener("Unicorn", Arc::new(RejectBlankTags))
        .build()
        .await;
    assert!(matches!(result, Err(AppError::ConfigurationError(_))));
}

#[tokio::test]
async fn test_immutable_entity_is_never_updated() {
    let db = setup().await;
    let euro = Currency::new("EUR", "Euro");
    let mut session = db.factory.open_session().await.unwrap();
    session.persist(&euro).await.unwrap();
    assert!(session.is_read_only(&euro));
    session.flush().await.unwrap();
    session.close().await.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    session.begin_transaction().await.unwrap();
    let loaded = session.load::<Currency>("EUR").await.unwrap();
    assert!(session.is_read_only(&loaded));
    assert!(matches!(
        session.set_read_only(&loaded, false),
        Err(AppError::InvalidArgument(_))
    ));
    assert!(session.is_read_only(&loaded));

    loaded.write().name = "Changed".to_string();
    assert!(!session.is_dirty().await.unwrap());
    db.log.clear();
    session.commit().await.unwrap();
    assert!(db.log.summary().is_empty());
    session.close().await.unwrap();

    let mut session = db.factory.open_session().await.unwrap();
    let stored = session.load::<Currency>("EUR").await.unwrap();
    assert_eq!(stored.read().name, "Euro");
}
