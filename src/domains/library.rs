// Library domain - authors, books and tags
// Demo model used by the admin binary and throughout the tests

use chrono::{DateTime, Utc};
use std::fmt;

use crate::core::{Identifier, Value};
use crate::error::AppResult;
use crate::mapping::{
    CascadeStyle, CascadeType, Entity, EntityMetadata, EntityRef, EntityState, IdStrategy,
    Metamodel, PropertyMapping, SqlType,
};

/// Versioned, cacheable author owning its books
#[derive(Clone, Default)]
pub struct Author {
    pub id: Option<i64>,
    pub name: String,
    pub email: Option<String>,
    pub version: i64,
    pub updated_at: Option<DateTime<Utc>>,
    pub books: Vec<EntityRef<Book>>,
}

impl Author {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

// books point back at their author, so only the count is printed
impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Author")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("version", &self.version)
            .field("books", &self.books.len())
            .finish()
    }
}

impl Entity for Author {
    fn entity_name() -> &'static str {
        "Author"
    }

    fn identifier(&self) -> Option<Identifier> {
        self.id.map(Identifier::Integer)
    }

    fn set_identifier(&mut self, id: Identifier) {
        self.id = id.as_i64();
    }

    fn to_state(&self) -> EntityState {
        EntityState::new()
            .with(self.name.as_str())
            .with(self.email.clone())
            .with(self.version)
            .with(self.updated_at)
            .with(&self.books)
    }

    fn from_state(state: &EntityState) -> AppResult<Self> {
        Ok(Self {
            id: None,
            name: state.required_text(0)?,
            email: state.text(1)?,
            version: state.integer(2)?.unwrap_or(0),
            updated_at: state.timestamp(3)?,
            books: state.collection(4)?,
        })
    }
}

/// Book with an optional author and a set of tags
#[derive(Debug, Clone, Default)]
pub struct Book {
    pub id: Option<i64>,
    pub title: String,
    pub pages: Option<i64>,
    pub author: Option<EntityRef<Author>>,
    pub tags: Vec<EntityRef<Tag>>,
}

impl Book {
    pub fn new(title: &str, author: Option<&EntityRef<Author>>) -> Self {
        Self {
            title: title.to_string(),
            author: author.cloned(),
            ..Default::default()
        }
    }
}

impl Entity for Book {
    fn entity_name() -> &'static str {
        "Book"
    }

    fn identifier(&self) -> Option<Identifier> {
        self.id.map(Identifier::Integer)
    }

    fn set_identifier(&mut self, id: Identifier) {
        self.id = id.as_i64();
    }

    fn to_state(&self) -> EntityState {
        EntityState::new()
            .with(self.title.as_str())
            .with(self.pages)
            .with(self.author.as_ref().map(Value::from).unwrap_or_default())
            .with(&self.tags)
    }

    fn from_state(state: &EntityState) -> AppResult<Self> {
        Ok(Self {
            id: None,
            title: state.required_text(0)?,
            pages: state.integer(1)?,
            author: state.reference(2)?,
            tags: state.collection(3)?,
        })
    }
}

/// Tag keyed by its application-assigned slug
#[derive(Debug, Clone, Default)]
pub struct Tag {
    pub id: Option<String>,
    pub name: String,
}

impl Tag {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
        }
    }
}

impl Entity for Tag {
    fn entity_name() -> &'static str {
        "Tag"
    }

    fn identifier(&self) -> Option<Identifier> {
        self.id.clone().map(Identifier::Text)
    }

    fn set_identifier(&mut self, id: Identifier) {
        self.id = id.as_str().map(str::to_string);
    }

    fn to_state(&self) -> EntityState {
        EntityState::new().with(self.name.as_str())
    }

    fn from_state(state: &EntityState) -> AppResult<Self> {
        Ok(Self {
            id: None,
            name: state.required_text(0)?,
        })
    }
}

pub fn library_metamodel() -> AppResult<Metamodel> {
    let author = EntityMetadata::builder("Author", "authors")
        .id("id", SqlType::Integer, IdStrategy::Increment)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .basic("email", SqlType::Text)
        .version("version")
        .basic("updated_at", SqlType::Timestamp)
        .property(
            PropertyMapping::one_to_many("books", "Book", "author_id")
                .inverse()
                .cascade(CascadeStyle::all())
                .orphan_removal(),
        )
        .cacheable()
        .build()?;

    let book = EntityMetadata::builder("Book", "books")
        .id("id", SqlType::Integer, IdStrategy::Snowflake)
        .property(PropertyMapping::basic("title", SqlType::Text).not_null())
        .basic("pages", SqlType::Integer)
        .property(PropertyMapping::many_to_one("author", "Author"))
        .property(
            PropertyMapping::many_to_many("tags", "Tag", "book_tags", "book_id", "tag_id")
                .cascade(CascadeStyle::of(&[CascadeType::Persist, CascadeType::Merge])),
        )
        .dynamic_update()
        .build()?;

    let tag = EntityMetadata::builder("Tag", "tags")
        .id("id", SqlType::Text, IdStrategy::Assigned)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .build()?;

    Metamodel::new()
        .with::<Author>(author)?
        .with::<Book>(book)?
        .with::<Tag>(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_metamodel_validates() {
        let model = library_metamodel().unwrap();
        model.validate().unwrap();
        assert_eq!(model.entity_names(), &["Author", "Book", "Tag"]);

        let author = model.metadata("Author").unwrap();
        assert_eq!(author.version, author.property_index("version"));
        assert!(author.cacheable);
    }

    #[test]
    fn test_state_round_trip_keeps_references() {
        let author = EntityRef::new(Author::new("Le Guin"));
        let book = Book::new("The Dispossessed", Some(&author));
        let restored = Book::from_state(&book.to_state()).unwrap();
        assert!(restored.author.unwrap().ptr_eq(&author));
        assert_eq!(restored.title, "The Dispossessed");
    }
}
