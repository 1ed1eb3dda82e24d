// Actions - units of work queued by the session and executed at flush

use crate::core::{Identifier, InstanceId};
use crate::engine::second_level_cache::CacheEntry;
use crate::mapping::{EntityLink, EntityState};

#[derive(Debug, Clone)]
pub struct EntityInsertAction {
    pub link: EntityLink,
    pub entity_name: &'static str,
    pub table: String,
    /// State written by the insert, transient references already nulled
    pub state: EntityState,
    /// Identity inserts run immediately to obtain the generated key
    pub early: bool,
}

impl EntityInsertAction {
    pub fn instance(&self) -> InstanceId {
        self.link.instance_id()
    }
}

#[derive(Debug, Clone)]
pub struct EntityUpdateAction {
    pub link: EntityLink,
    pub entity_name: &'static str,
    pub table: String,
    pub id: Identifier,
    pub state: EntityState,
    pub dirty: Vec<usize>,
    pub previous_version: Option<i64>,
    pub next_version: Option<i64>,
}

impl EntityUpdateAction {
    pub fn instance(&self) -> InstanceId {
        self.link.instance_id()
    }
}

#[derive(Debug, Clone)]
pub struct EntityDeleteAction {
    pub link: EntityLink,
    pub entity_name: &'static str,
    pub table: String,
    pub id: Identifier,
    pub orphan: bool,
}

impl EntityDeleteAction {
    pub fn instance(&self) -> InstanceId {
        self.link.instance_id()
    }
}

#[derive(Debug, Clone)]
pub enum CollectionActionKind {
    /// Write every element of a collection new to the database
    Recreate { elements: Vec<EntityLink> },
    /// Apply the difference against the snapshot
    Update {
        added: Vec<EntityLink>,
        removed: Vec<EntityLink>,
    },
    /// Remove all rows of a collection whose owner is deleted
    Remove,
}

#[derive(Debug, Clone)]
pub struct CollectionAction {
    pub owner: EntityLink,
    pub owner_name: &'static str,
    pub property: usize,
    pub role: String,
    /// Table touched by the action's statements
    pub space: String,
    pub kind: CollectionActionKind,
}

impl CollectionAction {
    pub fn owner_instance(&self) -> InstanceId {
        self.owner.instance_id()
    }
}

/// Work deferred until the transaction completes
#[derive(Debug, Clone)]
pub enum CompletionProcess {
    CachePut {
        entity_name: String,
        key: String,
        entry: CacheEntry,
    },
    CacheEvict {
        entity_name: String,
        key: String,
    },
}
