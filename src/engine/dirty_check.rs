// Dirty checking - compare the current state of an instance with its snapshot

use crate::core::Value;
use crate::mapping::{EntityLink, EntityMetadata, EntityState};

/// Positions of column properties whose value changed.
///
/// Collections are diffed separately, the version property is owned by the
/// engine and non-updatable properties are never written by an update.
pub fn find_dirty(meta: &EntityMetadata, loaded: &EntityState, current: &EntityState) -> Vec<usize> {
    meta.column_properties()
        .filter(|(index, property)| property.updatable && Some(*index) != meta.version)
        .filter(|(index, _)| loaded.get(*index) != current.get(*index))
        .map(|(index, _)| index)
        .collect()
}

/// Elements added to and removed from a collection since its snapshot
pub fn diff_elements(snapshot: &[EntityLink], current: &[EntityLink]) -> (Vec<EntityLink>, Vec<EntityLink>) {
    let added = current
        .iter()
        .filter(|e| !snapshot.iter().any(|s| s.same_entity(e)))
        .cloned()
        .collect();
    let removed = snapshot
        .iter()
        .filter(|s| !current.iter().any(|e| e.same_entity(s)))
        .cloned()
        .collect();
    (added, removed)
}

/// Elements of the collection property at `index`, empty when null
pub fn elements_of(state: &EntityState, index: usize) -> Vec<EntityLink> {
    match state.get(index) {
        Value::Collection(links) => links.clone(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::library::{self, Author, Tag};
    use crate::mapping::EntityRef;

    #[test]
    fn test_unchanged_state_is_clean() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Author").unwrap();
        let author = EntityRef::new(Author::new("Le Guin"));
        let state = author.link().state();
        assert!(find_dirty(&meta, &state, &state.clone()).is_empty());
    }

    #[test]
    fn test_changed_basic_property_is_dirty() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Author").unwrap();
        let author = EntityRef::new(Author::new("Le Guin"));
        let loaded = author.link().state();

        author.write().name = "Ursula K. Le Guin".to_string();
        author.write().version = 7;
        let current = author.link().state();

        let dirty = find_dirty(&meta, &loaded, &current);
        assert_eq!(dirty, vec![meta.property_index("name").unwrap()]);
    }

    #[test]
    fn test_collection_diff_by_identity() {
        let rust = EntityRef::new(Tag::new("rust", "Rust")).link();
        let sql = EntityRef::new(Tag::new("sql", "SQL")).link();
        let orm = EntityRef::new(Tag::new("orm", "ORM")).link();

        let (added, removed) = diff_elements(&[rust.clone(), sql.clone()], &[rust, orm.clone()]);
        assert_eq!(added.len(), 1);
        assert!(added[0].same_instance(&orm));
        assert_eq!(removed.len(), 1);
        assert!(removed[0].same_instance(&sql));
    }
}
