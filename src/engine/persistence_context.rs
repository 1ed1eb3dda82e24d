// Persistence context - identity map, entity entries and collection snapshots of one session

use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::core::{CollectionKey, EntityKey, EntityStatus, InstanceId};
use crate::engine::entity_entry::EntityEntry;
use crate::error::{AppError, AppResult};
use crate::mapping::EntityLink;

/// Element snapshot of a collection as last written to or read from the database
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub role: String,
    /// None until the collection exists in the database
    pub snapshot: Option<Vec<EntityLink>>,
}

#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities_by_key: HashMap<EntityKey, EntityLink>,
    entries: HashMap<InstanceId, EntityEntry>,
    entry_order: Vec<InstanceId>,
    collections: HashMap<CollectionKey, CollectionEntry>,
    pub cascade_level: usize,
    pub load_depth: usize,
    /// Instances loaded by the current outermost load, with whether they came from the cache
    pub pending_loads: Vec<(InstanceId, bool)>,
    pub flushing: bool,
    pub default_read_only: bool,
    operation_depth: usize,
    visited: HashSet<InstanceId>,
    merge_copies: HashMap<InstanceId, EntityLink>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a public operation; returns true for the outermost one
    pub fn begin_operation(&mut self) -> bool {
        self.operation_depth += 1;
        self.operation_depth == 1
    }

    pub fn end_operation(&mut self) {
        self.operation_depth = self.operation_depth.saturating_sub(1);
        if self.operation_depth == 0 {
            self.visited.clear();
            self.merge_copies.clear();
        }
    }

    pub fn is_top_level(&self) -> bool {
        self.operation_depth <= 1
    }

    /// Marks an instance visited by the running cascade; false if already seen
    pub fn visit(&mut self, instance: InstanceId) -> bool {
        self.visited.insert(instance)
    }

    pub fn reset_visited(&mut self) {
        self.visited.clear();
    }

    pub fn merge_copy(&self, source: InstanceId) -> Option<EntityLink> {
        self.merge_copies.get(&source).cloned()
    }

    pub fn record_merge_copy(&mut self, source: InstanceId, copy: EntityLink) {
        self.merge_copies.insert(source, copy);
    }

    pub fn add_entry(&mut self, entry: EntityEntry) -> AppResult<()> {
        let instance = entry.link.instance_id();
        if let Some(key) = entry.key() {
            self.check_uniqueness(&key, &entry.link)?;
            self.entities_by_key.insert(key, entry.link.clone());
        }
        trace!("Adding entry {:?} as {:?}", entry.link, entry.status);
        if self.entries.insert(instance, entry).is_none() {
            self.entry_order.push(instance);
        }
        Ok(())
    }

    /// A different instance already holding the key is an error
    pub fn check_uniqueness(&self, key: &EntityKey, link: &EntityLink) -> AppResult<()> {
        match self.entities_by_key.get(key) {
            Some(existing) if !existing.same_instance(link) => {
                Err(AppError::NonUniqueObject(key.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Register the key of an entry whose identifier became known late
    pub fn add_entity_key(&mut self, key: EntityKey, link: &EntityLink) -> AppResult<()> {
        self.check_uniqueness(&key, link)?;
        self.entities_by_key.insert(key.clone(), link.clone());
        if let Some(entry) = self.entries.get_mut(&link.instance_id()) {
            entry.id = Some(key.id);
        }
        Ok(())
    }

    pub fn remove_entity_key(&mut self, key: &EntityKey, link: &EntityLink) {
        if let Some(existing) = self.entities_by_key.get(key) {
            if existing.same_instance(link) {
                self.entities_by_key.remove(key);
            }
        }
    }

    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityLink> {
        self.entities_by_key.get(key).cloned()
    }

    pub fn entry(&self, instance: InstanceId) -> Option<&EntityEntry> {
        self.entries.get(&instance)
    }

    pub fn entry_mut(&mut self, instance: InstanceId) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&instance)
    }

    pub fn entry_for(&self, link: &EntityLink) -> Option<&EntityEntry> {
        self.entries.get(&link.instance_id())
    }

    pub fn status_of(&self, link: &EntityLink) -> Option<EntityStatus> {
        self.entry_for(link).map(|e| e.status)
    }

    pub fn contains_instance(&self, link: &EntityLink) -> bool {
        self.entries.contains_key(&link.instance_id())
    }

    /// Removes the entry, its key and the collections it owns
    pub fn remove_entry(&mut self, instance: InstanceId) -> Option<EntityEntry> {
        let entry = self.entries.remove(&instance)?;
        self.entry_order.retain(|i| *i != instance);
        if let Some(key) = entry.key() {
            self.remove_entity_key(&key, &entry.link);
        }
        self.collections.retain(|k, _| k.owner != instance);
        Some(entry)
    }

    /// Entry instances in the order they joined the context
    pub fn entry_ids(&self) -> Vec<InstanceId> {
        self.entry_order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_collection(&mut self, key: CollectionKey, role: String, snapshot: Option<Vec<EntityLink>>) {
        self.collections.insert(key, CollectionEntry { role, snapshot });
    }

    pub fn collection(&self, key: &CollectionKey) -> Option<&CollectionEntry> {
        self.collections.get(key)
    }

    pub fn set_collection_snapshot(&mut self, key: &CollectionKey, snapshot: Vec<EntityLink>) {
        if let Some(entry) = self.collections.get_mut(key) {
            entry.snapshot = Some(snapshot);
        }
    }

    pub fn collection_keys(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<CollectionKey> = self.collections.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn clear(&mut self) {
        self.entities_by_key.clear();
        self.entries.clear();
        self.entry_order.clear();
        self.collections.clear();
        self.pending_loads.clear();
        self.visited.clear();
        self.merge_copies.clear();
        self.cascade_level = 0;
        self.load_depth = 0;
        self.flushing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Identifier;
    use crate::domains::library::Tag;
    use crate::mapping::EntityRef;

    fn tag(id: &str) -> EntityLink {
        EntityRef::new(Tag::new(id, id)).link()
    }

    #[test]
    fn test_identity_map_uniqueness() {
        let mut context = PersistenceContext::new();
        let first = tag("rust");
        context
            .add_entry(EntityEntry::new(first.clone(), EntityStatus::Managed))
            .unwrap();

        let key = EntityKey::new("Tag", Identifier::from("rust"));
        assert!(context.get_entity(&key).unwrap().same_instance(&first));

        let duplicate = tag("rust");
        let err = context
            .add_entry(EntityEntry::new(duplicate, EntityStatus::Managed))
            .unwrap_err();
        assert!(matches!(err, AppError::NonUniqueObject(_)));
    }

    #[test]
    fn test_remove_entry_drops_key_and_collections() {
        let mut context = PersistenceContext::new();
        let link = tag("db");
        let instance = link.instance_id();
        context
            .add_entry(EntityEntry::new(link.clone(), EntityStatus::Managed))
            .unwrap();
        context.add_collection(CollectionKey::new(instance, 1), "Tag.books".into(), None);

        assert!(context.remove_entry(instance).is_some());
        assert!(context.is_empty());
        assert!(context.collection_keys().is_empty());
        assert!(context.get_entity(&link.key().unwrap()).is_none());
    }

    #[test]
    fn test_operation_depth_clears_visited() {
        let mut context = PersistenceContext::new();
        let link = tag("x");
        assert!(context.begin_operation());
        assert!(!context.begin_operation());
        assert!(context.visit(link.instance_id()));
        assert!(!context.visit(link.instance_id()));
        context.end_operation();
        context.end_operation();
        assert!(context.visit(link.instance_id()));
    }
}
