// Data seeder - sample library rows for the admin binary
// Runs through a regular session so ids, versions and cascades behave as in application code

use tracing::info;

use crate::domains::library::{Author, Book, Tag};
use crate::engine::SessionFactory;
use crate::error::AppResult;
use crate::mapping::EntityRef;

const SAMPLE: &[(&str, &str, &[(&str, i64, &[&str])])] = &[
    (
        "Ursula K. Le Guin",
        "ursula@example.org",
        &[
            ("The Dispossessed", 387, &["scifi", "classic"]),
            ("A Wizard of Earthsea", 183, &["fantasy", "classic"]),
        ],
    ),
    (
        "Octavia E. Butler",
        "octavia@example.org",
        &[("Kindred", 264, &["scifi"]), ("Parable of the Sower", 345, &["scifi"])],
    ),
    (
        "Terry Pratchett",
        "terry@example.org",
        &[("Small Gods", 284, &["fantasy", "humour"])],
    ),
];

/// Seed authors, books and tags unless the database already holds authors
pub async fn seed_library(factory: &SessionFactory) -> AppResult<()> {
    let mut session = factory.open_session().await?;

    let probe = session.query::<Author>().limit(1);
    let existing = session.list(&probe).await?;
    if !existing.is_empty() {
        info!("Library already seeded, skipping");
        session.close().await?;
        return Ok(());
    }

    session.begin_transaction().await?;

    let mut tags: Vec<(String, EntityRef<Tag>)> = Vec::new();
    let mut book_count = 0;
    for (name, email, books) in SAMPLE {
        let mut author = Author::new(name);
        author.email = Some(email.to_string());
        let author = EntityRef::new(author);

        for (title, pages, tag_ids) in books.iter() {
            let mut book = Book::new(title, Some(&author));
            book.pages = Some(*pages);
            for tag_id in tag_ids.iter() {
                let tag = match tags.iter().find(|(id, _)| id == tag_id) {
                    Some((_, tag)) => tag.clone(),
                    None => {
                        let tag = EntityRef::new(Tag::new(tag_id, &capitalize(tag_id)));
                        tags.push((tag_id.to_string(), tag.clone()));
                        tag
                    }
                };
                book.tags.push(tag);
            }
            author.write().books.push(EntityRef::new(book));
            book_count += 1;
        }

        // books and their tags follow through the cascade
        session.persist(&author).await?;
    }

    session.commit().await?;
    session.close().await?;

    info!(
        "Seeded {} authors, {} books and {} tags",
        SAMPLE.len(),
        book_count,
        tags.len()
    );
    Ok(())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
