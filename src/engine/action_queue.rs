// Action queue - pending inserts, updates, deletes and collection actions in execution order
// Execution order: orphan removals, inserts, updates, collection removals,
// collection updates, collection creations, deletions

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::core::{InstanceId, Value};
use crate::engine::actions::{
    CollectionAction, CompletionProcess, EntityDeleteAction, EntityInsertAction,
    EntityUpdateAction,
};

/// Inserts waiting for non-nullable references to transient instances
#[derive(Debug, Default)]
pub struct UnresolvedInserts {
    entries: Vec<(EntityInsertAction, HashSet<InstanceId>)>,
}

impl UnresolvedInserts {
    pub fn add(&mut self, action: EntityInsertAction, dependencies: HashSet<InstanceId>) {
        debug!(
            "Insert of {:?} waits on {} transient dependencies",
            action.link,
            dependencies.len()
        );
        self.entries.push((action, dependencies));
    }

    /// Drop `resolved` from every dependency set and hand back the inserts left with none
    pub fn resolve_dependents(&mut self, resolved: InstanceId) -> Vec<EntityInsertAction> {
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for (action, mut dependencies) in self.entries.drain(..) {
            dependencies.remove(&resolved);
            if dependencies.is_empty() {
                ready.push(action);
            } else {
                waiting.push((action, dependencies));
            }
        }
        self.entries = waiting;
        ready
    }

    pub fn contains(&self, instance: InstanceId) -> bool {
        self.entries.iter().any(|(a, _)| a.instance() == instance)
    }

    pub fn remove(&mut self, instance: InstanceId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(a, _)| a.instance() != instance);
        before != self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Waiting inserts, cleared from the queue
    pub fn drain(&mut self) -> Vec<EntityInsertAction> {
        self.entries.drain(..).map(|(a, _)| a).collect()
    }

    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|(a, deps)| format!("{:?} ({} unsaved references)", a.link, deps.len()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Default)]
pub struct ActionQueue {
    pub orphan_removals: Vec<EntityDeleteAction>,
    pub insertions: Vec<EntityInsertAction>,
    pub updates: Vec<EntityUpdateAction>,
    pub collection_removals: Vec<CollectionAction>,
    pub collection_updates: Vec<CollectionAction>,
    pub collection_creations: Vec<CollectionAction>,
    pub deletions: Vec<EntityDeleteAction>,
    pub unresolved: UnresolvedInserts,
    completion: Vec<CompletionProcess>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_any_queued_actions(&self) -> bool {
        !self.orphan_removals.is_empty()
            || !self.insertions.is_empty()
            || !self.updates.is_empty()
            || !self.collection_removals.is_empty()
            || !self.collection_updates.is_empty()
            || !self.collection_creations.is_empty()
            || !self.deletions.is_empty()
            || !self.unresolved.is_empty()
    }

    pub fn number_of_collection_removals(&self) -> usize {
        self.collection_removals.len()
    }

    /// True when a queued action writes one of the given tables
    pub fn are_tables_to_be_updated(&self, spaces: &HashSet<String>) -> bool {
        self.orphan_removals.iter().any(|a| spaces.contains(&a.table))
            || self.insertions.iter().any(|a| spaces.contains(&a.table))
            || self.updates.iter().any(|a| spaces.contains(&a.table))
            || self.deletions.iter().any(|a| spaces.contains(&a.table))
            || self
                .collection_removals
                .iter()
                .chain(self.collection_updates.iter())
                .chain(self.collection_creations.iter())
                .any(|a| spaces.contains(&a.space))
    }

    /// Discard the work scheduled by a flush preparation that turned out to be unnecessary
    pub fn clear_from_flush_needed_check(&mut self, previous_collection_removals: usize) {
        self.collection_creations.clear();
        self.collection_updates.clear();
        self.updates.clear();
        self.collection_removals.truncate(previous_collection_removals);
    }

    /// Cancel a scheduled delete of an instance that is being persisted again
    pub fn unschedule_deletion(&mut self, instance: InstanceId) -> bool {
        let before = self.deletions.len() + self.orphan_removals.len();
        self.deletions.retain(|a| a.instance() != instance);
        self.orphan_removals.retain(|a| a.instance() != instance);
        before != self.deletions.len() + self.orphan_removals.len()
    }

    /// Forget every action involving an instance leaving the session
    pub fn remove_actions_for(&mut self, instance: InstanceId) {
        self.insertions.retain(|a| a.instance() != instance);
        self.updates.retain(|a| a.instance() != instance);
        self.deletions.retain(|a| a.instance() != instance);
        self.orphan_removals.retain(|a| a.instance() != instance);
        self.collection_removals.retain(|a| a.owner_instance() != instance);
        self.collection_updates.retain(|a| a.owner_instance() != instance);
        self.collection_creations.retain(|a| a.owner_instance() != instance);
        self.unresolved.remove(instance);
    }

    pub fn sort_updates(&mut self) {
        self.updates.sort_by(|a, b| {
            (a.entity_name, &a.id).cmp(&(b.entity_name, &b.id))
        });
    }

    pub fn sort_insertions(&mut self) {
        let insertions = std::mem::take(&mut self.insertions);
        self.insertions = InsertActionSorter::default().sort(insertions);
    }

    pub fn register_completion(&mut self, process: CompletionProcess) {
        self.completion.push(process);
    }

    pub fn take_completion(&mut self) -> Vec<CompletionProcess> {
        std::mem::take(&mut self.completion)
    }

    /// Drop all pending actions, keeping completion processes
    pub fn clear(&mut self) {
        self.orphan_removals.clear();
        self.insertions.clear();
        self.updates.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
        self.deletions.clear();
        self.unresolved = UnresolvedInserts::default();
    }
}

/// Groups inserts of the same entity into batches while keeping every insert
/// behind the inserts of the instances it references.
#[derive(Default)]
struct InsertActionSorter {
    /// Latest batch number per entity name
    latest_batches: HashMap<&'static str, usize>,
    /// Batch number of each instance already placed
    entity_batch_number: HashMap<InstanceId, usize>,
    action_batches: Vec<Vec<EntityInsertAction>>,
}

impl InsertActionSorter {
    fn sort(mut self, insertions: Vec<EntityInsertAction>) -> Vec<EntityInsertAction> {
        for action in insertions {
            let entity_name = action.entity_name;
            let batch_number = match self.latest_batches.get(entity_name).copied() {
                Some(latest) => self.find_batch_number(&action, latest),
                None => {
                    let batch = self.action_batches.len();
                    self.latest_batches.insert(entity_name, batch);
                    batch
                }
            };
            self.entity_batch_number
                .insert(action.instance(), batch_number);
            self.add_to_batch(batch_number, action);
        }
        self.action_batches.into_iter().flatten().collect()
    }

    fn find_batch_number(&mut self, action: &EntityInsertAction, latest: usize) -> usize {
        for value in action.state.values() {
            let Value::Reference(target) = value else {
                continue;
            };
            let association_batch = self.entity_batch_number.get(&target.instance_id());
            if matches!(association_batch, Some(batch) if *batch > latest) {
                // Referenced instance sits in a later batch; open a new one after it
                let batch = self.action_batches.len();
                self.latest_batches.insert(action.entity_name, batch);
                return batch;
            }
        }
        latest
    }

    fn add_to_batch(&mut self, batch_number: usize, action: EntityInsertAction) {
        if batch_number == self.action_batches.len() {
            self.action_batches.push(Vec::new());
        }
        self.action_batches[batch_number].push(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::library::{Author, Book};
    use crate::mapping::{EntityLink, EntityRef};

    fn insert_of(link: EntityLink, table: &str) -> EntityInsertAction {
        EntityInsertAction {
            entity_name: link.entity_name(),
            table: table.to_string(),
            state: link.state(),
            link,
            early: false,
        }
    }

    #[test]
    fn test_insert_sorter_batches_by_entity() {
        let a1 = EntityRef::new(Author::new("A1"));
        let b1 = EntityRef::new(Book::new("B1", Some(&a1)));
        let a2 = EntityRef::new(Author::new("A2"));
        let b2 = EntityRef::new(Book::new("B2", Some(&a2)));

        let mut queue = ActionQueue::new();
        queue.insertions.push(insert_of(a1.link(), "authors"));
        queue.insertions.push(insert_of(b1.link(), "books"));
        queue.insertions.push(insert_of(a2.link(), "authors"));
        queue.insertions.push(insert_of(b2.link(), "books"));
        queue.sort_insertions();

        let order: Vec<&str> = queue.insertions.iter().map(|a| a.entity_name).collect();
        assert_eq!(order, vec!["Author", "Author", "Book", "Book"]);
        assert!(queue.insertions[0].link.same_instance(&a1.link()));
        assert!(queue.insertions[1].link.same_instance(&a2.link()));
    }

    #[test]
    fn test_insert_sorter_opens_batch_after_referenced_instance() {
        // input already in dependency order stays in dependency order
        let standalone = EntityRef::new(Book::new("Standalone", None));
        let author = EntityRef::new(Author::new("A1"));
        let book = EntityRef::new(Book::new("B1", Some(&author)));

        let mut queue = ActionQueue::new();
        queue.insertions.push(insert_of(standalone.link(), "books"));
        queue.insertions.push(insert_of(author.link(), "authors"));
        queue.insertions.push(insert_of(book.link(), "books"));
        queue.sort_insertions();

        let order: Vec<EntityLink> = queue.insertions.iter().map(|a| a.link.clone()).collect();
        assert_eq!(order.len(), 3);
        assert!(order[0].same_instance(&standalone.link()));
        assert!(order[1].same_instance(&author.link()));
        assert!(order[2].same_instance(&book.link()));
    }

    #[test]
    fn test_unresolved_inserts_resolve() {
        let author = EntityRef::new(Author::new("A"));
        let book = EntityRef::new(Book::new("B", Some(&author)));

        let mut unresolved = UnresolvedInserts::default();
        let mut deps = HashSet::new();
        deps.insert(author.link().instance_id());
        unresolved.add(insert_of(book.link(), "books"), deps);
        assert!(unresolved.contains(book.link().instance_id()));

        let ready = unresolved.resolve_dependents(author.link().instance_id());
        assert_eq!(ready.len(), 1);
        assert!(unresolved.is_empty());
    }

    #[test]
    fn test_unschedule_deletion_and_table_check() {
        let author = EntityRef::new(Author::new("A"));
        author.write().id = Some(1);
        let mut queue = ActionQueue::new();
        queue.deletions.push(EntityDeleteAction {
            link: author.link(),
            entity_name: "Author",
            table: "authors".into(),
            id: 1.into(),
            orphan: false,
        });

        let spaces: HashSet<String> = ["authors".to_string()].into_iter().collect();
        assert!(queue.are_tables_to_be_updated(&spaces));
        let other: HashSet<String> = ["tags".to_string()].into_iter().collect();
        assert!(!queue.are_tables_to_be_updated(&other));

        assert!(queue.unschedule_deletion(author.link().instance_id()));
        assert!(!queue.has_any_queued_actions());
    }
}
