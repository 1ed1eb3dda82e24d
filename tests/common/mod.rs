// Shared fixtures for the integration tests
// A temp-file SQLite database behind a statement log, the library model and a few extra mappings
#![allow(dead_code)]

use std::fmt;
use std::sync::Arc;

use tempfile::TempDir;
use unit_of_work::domains::library::{self, Author, Book, Tag};
use unit_of_work::engine::{SessionFactoryBuilder, SessionFactoryConfig};
use unit_of_work::infrastructure::{LoggingConnectionProvider, SqliteConnectionProvider, StatementLog};
use unit_of_work::mapping::{
    CascadeStyle, CascadeType, EntityMetadata, IdStrategy, PropertyMapping, SqlType,
};
use unit_of_work::{AppResult, Entity, EntityRef, EntityState, Identifier, Metamodel, SessionFactory};

/// Reference data mapped immutable: loaded read-only and never updated
#[derive(Debug, Clone, Default)]
pub struct Currency {
    pub code: Option<String>,
    pub name: String,
}

impl Currency {
    pub fn new(code: &str, name: &str) -> EntityRef<Self> {
        EntityRef::new(Self {
            code: Some(code.to_string()),
            name: name.to_string(),
        })
    }
}

impl Entity for Currency {
    fn entity_name() -> &'static str {
        "Currency"
    }

    fn identifier(&self) -> Option<Identifier> {
        self.code.clone().map(Identifier::Text)
    }

    fn set_identifier(&mut self, id: Identifier) {
        self.code = id.as_str().map(str::to_string);
    }

    fn to_state(&self) -> EntityState {
        EntityState::new().with(self.name.as_str())
    }

    fn from_state(state: &EntityState) -> AppResult<Self> {
        Ok(Self {
            code: None,
            name: state.required_text(0)?,
        })
    }
}

/// Department referenced by employees through a non-null foreign key
#[derive(Debug, Clone, Default)]
pub struct Department {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Department {
    fn entity_name() -> &'static str {
        "Department"
    }

    fn identifier(&self) -> Option<Identifier> {
        self.id.map(Identifier::Integer)
    }

    fn set_identifier(&mut self, id: Identifier) {
        self.id = id.as_i64();
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

#[derive(Debug, Clone, Default)]
pub struct Employee {
    pub id: Option<i64>,
    pub name: String,
    pub department: Option<EntityRef<Department>>,
}

impl Entity for Employee {
    fn entity_name() -> &'static str {
        "Employee"
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
            .with(self.department.as_ref())
    }

    fn from_state(state: &EntityState) -> AppResult<Self> {
        Ok(Self {
            id: None,
            name: state.required_text(0)?,
            department: state.reference(1)?,
        })
    }
}

/// Folder keyed by a database-generated identity, owning its documents
#[derive(Debug, Clone, Default)]
pub struct Folder {
    pub id: Option<i64>,
    pub name: String,
    pub documents: Vec<EntityRef<Document>>,
}

impl Entity for Folder {
    fn entity_name() -> &'static str {
        "Folder"
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
            .with(&self.documents)
    }

    fn from_state(state: &EntityState) -> AppResult<Self> {
        Ok(Self {
            id: None,
            name: state.required_text(0)?,
            documents: state.collection(1)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    pub id: Option<i64>,
    pub name: String,
}

impl Document {
    pub fn named(name: &str) -> EntityRef<Document> {
        EntityRef::new(Document {
            id: None,
            name: name.to_string(),
        })
    }
}

impl Entity for Document {
    fn entity_name() -> &'static str {
        "Document"
    }

    fn identifier(&self) -> Option<Identifier> {
        self.id.map(Identifier::Integer)
    }

    fn set_identifier(&mut self, id: Identifier) {
        self.id = id.as_i64();
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

/// Person with a UUID key and an optional self-reference
#[derive(Clone, Default)]
pub struct Person {
    pub id: Option<String>,
    pub name: String,
    pub best_friend: Option<EntityRef<Person>>,
}

impl Person {
    pub fn named(name: &str) -> EntityRef<Person> {
        EntityRef::new(Person {
            name: name.to_string(),
            ..Default::default()
        })
    }
}

// friendships can be cyclic
impl fmt::Debug for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Person")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("best_friend", &self.best_friend.as_ref().and_then(|p| p.id()))
            .finish()
    }
}

impl Entity for Person {
    fn entity_name() -> &'static str {
        "Person"
    }

    fn identifier(&self) -> Option<Identifier> {
        self.id.clone().map(Identifier::Text)
    }

    fn set_identifier(&mut self, id: Identifier) {
        self.id = id.as_str().map(str::to_string);
    }

    fn to_state(&self) -> EntityState {
        EntityState::new()
            .with(self.name.as_str())
            .with(self.best_friend.as_ref())
    }

    fn from_state(state: &EntityState) -> AppResult<Self> {
        Ok(Self {
            id: None,
            name: state.required_text(0)?,
            best_friend: state.reference(1)?,
        })
    }
}

pub fn test_metamodel() -> Metamodel {
    let department = EntityMetadata::builder("Department", "departments")
        .id("id", SqlType::Integer, IdStrategy::Increment)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .build()
        .unwrap();
    let employee = EntityMetadata::builder("Employee", "employees")
        .id("id", SqlType::Integer, IdStrategy::Increment)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .property(PropertyMapping::many_to_one("department", "Department").not_null())
        .build()
        .unwrap();
    let folder = EntityMetadata::builder("Folder", "folders")
        .id("id", SqlType::Integer, IdStrategy::Identity)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .property(
            PropertyMapping::one_to_many("documents", "Document", "folder_id")
                .cascade(CascadeStyle::all())
                .orphan_removal(),
        )
        .build()
        .unwrap();
    let document = EntityMetadata::builder("Document", "documents")
        .id("id", SqlType::Integer, IdStrategy::Increment)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .build()
        .unwrap();
    let person = EntityMetadata::builder("Person", "persons")
        .id("id", SqlType::Text, IdStrategy::Uuid)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .property(
            PropertyMapping::many_to_one("best_friend", "Person")
                .cascade(CascadeStyle::of(&[CascadeType::Persist])),
        )
        .build()
        .unwrap();

    let currency = EntityMetadata::builder("Currency", "currencies")
        .id("code", SqlType::Text, IdStrategy::Assigned)
        .property(PropertyMapping::basic("name", SqlType::Text).not_null())
        .immutable()
        .build()
        .unwrap();

    library::library_metamodel()
        .unwrap()
        .with::<Currency>(currency)
        .unwrap()
        .with::<Department>(department)
        .unwrap()
        .with::<Employee>(employee)
        .unwrap()
        .with::<Folder>(folder)
        .unwrap()
        .with::<Document>(document)
        .unwrap()
        .with::<Person>(person)
        .unwrap()
}

pub struct TestDb {
    pub factory: SessionFactory,
    pub log: StatementLog,
    _dir: TempDir,
}

pub async fn setup() -> TestDb {
    setup_with(SessionFactoryConfig::default(), |builder| builder).await
}

pub async fn setup_with(
    config: SessionFactoryConfig,
    customize: impl FnOnce(SessionFactoryBuilder) -> SessionFactoryBuilder,
) -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("uow.db").display());
    let sqlite = SqliteConnectionProvider::connect(&url, 4).await.unwrap();
    let provider = Arc::new(LoggingConnectionProvider::new(Arc::new(sqlite)));
    let log = provider.log();

    let builder = SessionFactory::builder(test_metamodel(), provider).config(config);
    let factory = customize(builder).build().await.unwrap();
    log.clear();

    TestDb {
        factory,
        log,
        _dir: dir,
    }
}

/// An author with two books, not yet persisted
pub fn author_with_books(name: &str, titles: &[&str]) -> EntityRef<Author> {
    let author = EntityRef::new(Author::new(name));
    for title in titles {
        let book = EntityRef::new(Book::new(title, Some(&author)));
        author.write().books.push(book);
    }
    author
}

pub fn tag(id: &str) -> EntityRef<Tag> {
    EntityRef::new(Tag::new(id, id))
}
