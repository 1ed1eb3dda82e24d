mod common;

use common::{author_with_books, setup};
use unit_of_work::domains::library::{Author, Book, Tag};
use unit_of_work::engine::Predicate;
use unit_of_work::{AppError, EntityRef, FlushMode, SessionFactory};

async fn seed(factory: &SessionFactory) {
    let author = author_with_books("Ursula K. Le Guin", &["The Dispossessed", "A Wizard of Earthsea", "Lavinia"]);
    let pages = [387, 183, 279];
    for (book, pages) in author.read().books.iter().zip(pages) {
        book.write().pages = Some(pages);
    }
    let mut session = factory.open_session().await.unwrap();
    session.persist(&author).await.unwrap();
    session.flush().await.unwrap();
    session.close().await.unwrap();
}

fn titles(books: &[EntityRef<Book>]) -> Vec<String> {
    books.iter().map(|b| b.read().title.clone()).collect()
}

#[tokio::test]
async fn test_filter_order_and_limit() {
    let db = setup().await;
    seed(&db.factory).await;

    let mut session = db.factory.open_session().await.unwrap();
    let query = session
        .query::<Book>()
        .filter("pages", Predicate::Gt, 200i64)
        .order_by("title");
    let books = session.list(&query).await.unwrap();
    assert_eq!(titles(&books), vec!["Lavinia", "The Dispossessed"]);

    let query = session.query::<Book>().order_by_desc("pages").limit(1);
    let books = session.list(&query).await.unwrap();
    assert_eq!(titles(&books), vec!["The Dispossessed"]);

    let query = session
        .query::<Book>()
        .filter("title", Predicate::Like, "%Earthsea%");
    assert_eq!(session.list(&query).await.unwrap().len(), 1);
    assert_eq!(db.factory.statistics().queries, 3);
}

#[tokio::test]
async fn test_results_come_from_identity_map() {
    let db = setup().await;
    seed(&db.factory).await;

    let mut session = db.factory.open_session().await.unwrap();
    let authors = session.list(&session.query::<Author>()).await.unwrap();
    assert_eq!(authors.len(), 1);
    let author = &authors[0];

    let books = session
        .list(&session.query::<Book>().order_by("title"))
        .await
        .unwrap();
    assert_eq!(books.len(), 3);
    for book in &books {
        let owner = book.read().author.clone().unwrap();
        assert!(owner.ptr_eq(author));
        assert!(author.read().books.iter().any(|b| b.ptr_eq(book)));
    }

    let id = author.read().id.unwrap();
    let found = session.find::<Author>(id).await.unwrap().unwrap();
    assert!(found.ptr_eq(author));
}

#[tokio::test]
async fn test_auto_flush_only_for_touched_tables() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();
    session.begin_transaction().await.unwrap();

    let author = EntityRef::new(Author::new("Robin Hobb"));
    session.persist(&author).await.unwrap();

    let tags = session.list(&session.query::<Tag>()).await.unwrap();
    assert!(tags.is_empty());
    assert!(db.log.summary().is_empty());

    let authors = session.list(&session.query::<Author>()).await.unwrap();
    assert_eq!(db.log.summary(), vec!["insert authors"]);
    assert_eq!(authors.len(), 1);
    assert!(authors[0].ptr_eq(&author));
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_commit_flush_mode_skips_auto_flush() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();
    session.set_flush_mode(FlushMode::Commit);
    session.begin_transaction().await.unwrap();

    session.persist(&EntityRef::new(Author::new("Guy Gavriel Kay"))).await.unwrap();
    let authors = session.list(&session.query::<Author>()).await.unwrap();
    assert!(authors.is_empty());

    session.commit().await.unwrap();
    assert_eq!(db.log.summary(), vec!["insert authors"]);
}

#[tokio::test]
async fn test_always_flush_mode_flushes_before_unrelated_query() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();
    session.set_flush_mode(FlushMode::Always);
    session.begin_transaction().await.unwrap();

    session.persist(&EntityRef::new(Author::new("Robin Hobb"))).await.unwrap();
    let tags = session.list(&session.query::<Tag>()).await.unwrap();
    assert!(tags.is_empty());
    assert_eq!(db.log.summary(), vec!["insert authors"]);

    session.commit().await.unwrap();
    assert_eq!(db.log.summary(), vec!["insert authors"]);
}

#[tokio::test]
async fn test_manual_flush_mode_never_flushes_on_commit() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();
    session.set_flush_mode(FlushMode::Manual);
    session.begin_transaction().await.unwrap();
    session.persist(&EntityRef::new(Author::new("Unwritten"))).await.unwrap();
    session.commit().await.unwrap();
    assert!(db.log.summary().is_empty());
}

#[tokio::test]
async fn test_removed_instances_are_not_returned() {
    let db = setup().await;
    seed(&db.factory).await;

    let mut session = db.factory.open_session().await.unwrap();
    session.begin_transaction().await.unwrap();
    let query = session.query::<Book>().eq("title", "Lavinia");
    let lavinia = session.list(&query).await.unwrap().remove(0);
    let owner = lavinia.read().author.clone().unwrap();
    owner.write().books.retain(|b| !b.ptr_eq(&lavinia));

    let remaining = session.list(&session.query::<Book>()).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(db.log.summary().contains(&"delete books".to_string()));
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_invalid_query_properties() {
    let db = setup().await;
    let mut session = db.factory.open_session().await.unwrap();

    let by_collection = session.query::<Author>().eq("books", 1i64);
    assert!(matches!(
        session.list(&by_collection).await,
        Err(AppError::InvalidArgument(_))
    ));

    let unknown = session.query::<Author>().is_null("nickname");
    assert!(matches!(
        session.list(&unknown).await,
        Err(AppError::MappingError(_))
    ));
}
