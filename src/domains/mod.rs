// Domain models mapped onto the engine
pub mod library;

pub use library::{library_metamodel, Author, Book, Tag};
