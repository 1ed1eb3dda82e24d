// Flush - dirty checking, action scheduling and execution
// Also decides whether a query needs the pending changes written first

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::core::{EntityKey, EntityStatus, FlushMode, Identifier, LockMode, Value};
use crate::engine::actions::{
    CollectionAction, CollectionActionKind, CompletionProcess, EntityDeleteAction,
    EntityInsertAction, EntityUpdateAction,
};
use crate::engine::dirty_check::{diff_elements, elements_of, find_dirty};
use crate::engine::listeners::EntityEvent;
use crate::engine::second_level_cache::CacheEntry;
use crate::engine::session::Session;
use crate::engine::sql;
use crate::error::{AppError, AppResult};
use crate::mapping::{EntityLink, EntityMetadata, EntityState, PropertyKind};

impl Session {
    pub(crate) async fn flush_internal(&mut self) -> AppResult<()> {
        if self.context.flushing {
            return Err(AppError::Internal("Flush during flush".to_string()));
        }
        self.context.flushing = true;
        let result = match self.prepare_flush().await {
            Ok(()) => self.perform_executions().await,
            Err(e) => Err(e),
        };
        self.context.flushing = false;

        match result {
            Ok(()) => {
                self.post_flush().await;
                Ok(())
            }
            Err(e) => {
                warn!("Flush failed: {}", e);
                self.queue.clear();
                Err(e)
            }
        }
    }

    /// Flush before a query when pending changes touch the queried tables
    pub(crate) async fn auto_flush_if_required(&mut self, spaces: &HashSet<String>) -> AppResult<bool> {
        if self.context.flushing || !self.gateway.in_transaction() {
            return Ok(false);
        }
        match self.flush_mode {
            FlushMode::Manual | FlushMode::Commit => Ok(false),
            FlushMode::Always => {
                self.flush_internal().await?;
                Ok(true)
            }
            FlushMode::Auto => {
                let previous_removals = self.queue.number_of_collection_removals();
                self.context.flushing = true;
                let prepared = self.prepare_flush().await;
                self.context.flushing = false;
                if let Err(e) = prepared {
                    self.queue.clear_from_flush_needed_check(previous_removals);
                    return Err(e);
                }

                if !self.queue.are_tables_to_be_updated(spaces) {
                    self.queue.clear_from_flush_needed_check(previous_removals);
                    return Ok(false);
                }
                debug!("Auto flush before query on {:?}", spaces);
                self.context.flushing = true;
                let result = self.perform_executions().await;
                self.context.flushing = false;
                match result {
                    Ok(()) => {
                        self.post_flush().await;
                        Ok(true)
                    }
                    Err(e) => {
                        self.queue.clear();
                        Err(e)
                    }
                }
            }
        }
    }

    async fn prepare_flush(&mut self) -> AppResult<()> {
        self.cascade_on_flush().await?;
        if !self.queue.unresolved.is_empty() {
            return Err(AppError::TransientPropertyValue(self.queue.unresolved.describe()));
        }
        self.flush_entities().await?;
        self.flush_collections()
    }

    /// Schedule updates for dirty entities and for deleted entities whose
    /// references to other deleted entities must be nulled first
    async fn flush_entities(&mut self) -> AppResult<()> {
        let factory = self.factory.clone();
        for instance in self.context.entry_ids() {
            let Some(entry) = self.context.entry(instance).cloned() else {
                continue;
            };
            let meta = self.metadata(entry.entity_name)?;
            match entry.status {
                EntityStatus::Managed => {
                    let mut current = entry.link.state();
                    self.check_references(&meta, &current).await?;
                    if !meta.mutable {
                        continue;
                    }
                    let Some(loaded) = entry.loaded_state.as_ref() else {
                        continue;
                    };
                    let mut dirty = find_dirty(&meta, loaded, &current);
                    if !dirty.is_empty()
                        && factory
                            .listeners
                            .fire(EntityEvent::PreUpdate, &meta, entry.id.as_ref(), &mut current)
                            .await?
                    {
                        entry.link.apply_state(&current)?;
                        dirty = find_dirty(&meta, loaded, &current);
                    }
                    let forced = entry.lock_mode == LockMode::OptimisticForceIncrement;
                    if dirty.is_empty() && !forced {
                        continue;
                    }
                    let Some(id) = entry.id.clone() else {
                        continue;
                    };

                    let (previous_version, next_version) = match meta.version {
                        Some(index) => {
                            let previous = entry.version.unwrap_or(0);
                            current.set(index, Value::Integer(previous + 1));
                            dirty.push(index);
                            (Some(previous), Some(previous + 1))
                        }
                        None => (None, None),
                    };
                    self.queue.updates.push(EntityUpdateAction {
                        link: entry.link.clone(),
                        entity_name: entry.entity_name,
                        table: meta.table.clone(),
                        id,
                        state: current,
                        dirty,
                        previous_version,
                        next_version,
                    });
                }
                EntityStatus::Deleted => {
                    let (Some(loaded), Some(deleted), Some(id)) =
                        (&entry.loaded_state, &entry.deleted_state, &entry.id)
                    else {
                        continue;
                    };
                    let dirty = find_dirty(&meta, loaded, deleted);
                    if dirty.is_empty() {
                        continue;
                    }
                    self.queue.updates.push(EntityUpdateAction {
                        link: entry.link.clone(),
                        entity_name: entry.entity_name,
                        table: meta.table.clone(),
                        id: id.clone(),
                        state: deleted.clone(),
                        dirty,
                        previous_version: entry.version,
                        next_version: entry.version,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn flush_collections(&mut self) -> AppResult<()> {
        for key in self.context.collection_keys() {
            let Some(owner) = self.context.entry(key.owner).cloned() else {
                continue;
            };
            let meta = self.metadata(owner.entity_name)?;
            let Some(PropertyKind::Collection(mapping)) = meta.properties.get(key.property).map(|p| &p.kind) else {
                continue;
            };
            if mapping.is_inverse() {
                continue;
            }
            let Some(collection) = self.context.collection(&key).cloned() else {
                continue;
            };
            let target = self.metadata(&mapping.target)?;

            let kind = match owner.status {
                EntityStatus::Deleted if collection.snapshot.is_some() => CollectionActionKind::Remove,
                EntityStatus::Managed | EntityStatus::ReadOnly => {
                    let current = elements_of(&owner.link.state(), key.property);
                    match &collection.snapshot {
                        None if current.is_empty() => continue,
                        None => CollectionActionKind::Recreate { elements: current },
                        Some(snapshot) => {
                            let (added, removed) = diff_elements(snapshot, &current);
                            if added.is_empty() && removed.is_empty() {
                                continue;
                            }
                            CollectionActionKind::Update { added, removed }
                        }
                    }
                }
                _ => continue,
            };

            let action = CollectionAction {
                owner: owner.link.clone(),
                owner_name: owner.entity_name,
                property: key.property,
                role: collection.role.clone(),
                space: mapping.query_space(&target.table),
                kind,
            };
            match action.kind {
                CollectionActionKind::Remove => self.queue.collection_removals.push(action),
                CollectionActionKind::Update { .. } => self.queue.collection_updates.push(action),
                CollectionActionKind::Recreate { .. } => self.queue.collection_creations.push(action),
            }
        }
        Ok(())
    }

    async fn perform_executions(&mut self) -> AppResult<()> {
        if self.factory.config.order_updates {
            self.queue.sort_updates();
        }

        for action in std::mem::take(&mut self.queue.orphan_removals) {
            self.execute_delete(action).await?;
        }
        self.execute_inserts().await?;
        for action in std::mem::take(&mut self.queue.updates) {
            self.execute_update(action).await?;
        }
        for action in std::mem::take(&mut self.queue.collection_removals) {
            self.execute_collection_action(action).await?;
        }
        for action in std::mem::take(&mut self.queue.collection_updates) {
            self.execute_collection_action(action).await?;
        }
        for action in std::mem::take(&mut self.queue.collection_creations) {
            self.execute_collection_action(action).await?;
        }
        for action in std::mem::take(&mut self.queue.deletions) {
            self.execute_delete(action).await?;
        }
        Ok(())
    }

    /// Run every queued insert
    pub(crate) async fn execute_inserts(&mut self) -> AppResult<()> {
        if self.factory.config.order_inserts {
            self.queue.sort_insertions();
        }
        for action in std::mem::take(&mut self.queue.insertions) {
            self.execute_insert(action).await?;
        }
        Ok(())
    }

    pub(crate) async fn execute_insert(&mut self, action: EntityInsertAction) -> AppResult<()> {
        let meta = self.metadata(action.entity_name)?;
        let assigned = action.link.identifier();
        let statement = sql::insert(&meta, assigned.as_ref(), &action.state)?;
        let result = self.execute(&statement).await?;

        let id = match assigned {
            Some(id) => id,
            None => {
                let generated = result.last_insert_id.ok_or_else(|| {
                    AppError::IdGenerationError(format!(
                        "Database returned no key for '{}'",
                        meta.name
                    ))
                })?;
                let id = Identifier::Integer(generated);
                action.link.set_identifier(id.clone());
                self.context
                    .add_entity_key(EntityKey::new(meta.name.clone(), id.clone()), &action.link)?;
                id
            }
        };
        let version = self.context.entry(action.instance()).and_then(|e| e.version);
        if let Some(entry) = self.context.entry_mut(action.instance()) {
            entry.exists_in_database = true;
        }
        self.factory.statistics.entity_inserted();

        let factory = self.factory.clone();
        let mut state = action.state.clone();
        factory
            .listeners
            .fire(EntityEvent::PostInsert, &meta, Some(&id), &mut state)
            .await?;

        if self.region(&meta.name).is_some() {
            let key = EntityKey::new(meta.name.clone(), id);
            self.register_cache_put(&meta, &key, version, &action.state);
        }
        Ok(())
    }

    async fn execute_update(&mut self, action: EntityUpdateAction) -> AppResult<()> {
        let meta = self.metadata(action.entity_name)?;
        let statement = sql::update(
            &meta,
            &action.id,
            &action.state,
            &action.dirty,
            action.previous_version,
        )?;
        if let Some(statement) = statement {
            let result = self.execute(&statement).await?;
            if result.rows_affected != 1 {
                return Err(self.stale(&meta, &action.id));
            }
        }

        let instance = action.instance();
        let mut deleted = false;
        if let Some(entry) = self.context.entry_mut(instance) {
            deleted = entry.status.is_deleted_or_gone();
            entry.version = action.next_version.or(entry.version);
            entry.loaded_state = Some(action.state.clone());
            if entry.lock_mode == LockMode::OptimisticForceIncrement {
                entry.lock_mode = LockMode::None;
            }
        }
        if let (Some(index), Some(next)) = (meta.version, action.next_version) {
            if !deleted && action.previous_version != action.next_version {
                let mut current = action.link.state();
                current.set(index, Value::Integer(next));
                action.link.apply_state(&current)?;
            }
        }
        self.factory.statistics.entity_updated();

        let factory = self.factory.clone();
        let mut state = action.state.clone();
        factory
            .listeners
            .fire(EntityEvent::PostUpdate, &meta, Some(&action.id), &mut state)
            .await?;

        if let Some(region) = self.region(&meta.name) {
            let key = EntityKey::new(meta.name.clone(), action.id.clone());
            if let Err(e) = region.evict(&key.cache_key()).await {
                warn!("Cache evict of {} failed: {}", key, e);
            }
            if deleted {
                self.register_cache_evict(&key);
            } else {
                self.register_cache_put(&meta, &key, action.next_version, &action.state);
            }
        }
        Ok(())
    }

    async fn execute_delete(&mut self, action: EntityDeleteAction) -> AppResult<()> {
        let meta = self.metadata(action.entity_name)?;
        let instance = action.instance();
        let version = if meta.is_versioned() {
            self.context.entry(instance).and_then(|e| e.version)
        } else {
            None
        };
        let statement = sql::delete(&meta, &action.id, version)?;
        let result = self.execute(&statement).await?;
        if result.rows_affected != 1 {
            return Err(self.stale(&meta, &action.id));
        }

        let key = EntityKey::new(meta.name.clone(), action.id.clone());
        if let Some(entry) = self.context.entry_mut(instance) {
            entry.status = EntityStatus::Gone;
            entry.exists_in_database = false;
        }
        self.context.remove_entity_key(&key, &action.link);
        self.factory.statistics.entity_deleted();

        let factory = self.factory.clone();
        let mut state = action.link.state();
        factory
            .listeners
            .fire(EntityEvent::PostDelete, &meta, Some(&action.id), &mut state)
            .await?;

        if let Some(region) = self.region(&meta.name) {
            if let Err(e) = region.evict(&key.cache_key()).await {
                warn!("Cache evict of {} failed: {}", key, e);
            }
            self.register_cache_evict(&key);
        }
        Ok(())
    }

    async fn execute_collection_action(&mut self, action: CollectionAction) -> AppResult<()> {
        let owner_meta = self.metadata(action.owner_name)?;
        let PropertyKind::Collection(mapping) = &owner_meta.properties[action.property].kind else {
            return Err(AppError::MappingError(format!("{} is not a collection", action.role)));
        };
        let target = self.metadata(&mapping.target)?;
        let owner_id = action.owner.identifier().ok_or_else(|| {
            AppError::TransientObject(format!("Owner of {} has no identifier", action.role))
        })?;
        let element_id = |element: &EntityLink| {
            element.identifier().ok_or_else(|| {
                AppError::TransientObject(format!("{} holds an unsaved element", action.role))
            })
        };

        match &action.kind {
            CollectionActionKind::Recreate { elements } => {
                for element in elements {
                    let statement = sql::insert_element(mapping, &target, &owner_id, &element_id(element)?);
                    self.execute(&statement).await?;
                }
                self.factory.statistics.collection_recreated();
            }
            CollectionActionKind::Update { added, removed } => {
                for element in removed {
                    let statement = sql::delete_element(mapping, &target, &owner_id, &element_id(element)?);
                    self.execute(&statement).await?;
                }
                for element in added {
                    let statement = sql::insert_element(mapping, &target, &owner_id, &element_id(element)?);
                    self.execute(&statement).await?;
                }
                self.factory.statistics.collection_updated();
            }
            CollectionActionKind::Remove => {
                let statement = sql::delete_all_elements(mapping, &target, &owner_id);
                self.execute(&statement).await?;
                self.factory.statistics.collection_removed();
            }
        }
        Ok(())
    }

    /// Forget deleted instances and take new collection snapshots.
    /// A cached owner whose collection changed, inverse ones included, is evicted.
    async fn post_flush(&mut self) {
        for instance in self.context.entry_ids() {
            if matches!(self.context.entry(instance), Some(e) if e.status == EntityStatus::Gone) {
                self.context.remove_entry(instance);
            }
        }
        let mut stale_owners = Vec::new();
        for key in self.context.collection_keys() {
            let (current, previous, owner) = match self.context.entry(key.owner) {
                Some(owner) if matches!(owner.status, EntityStatus::Managed | EntityStatus::ReadOnly) => {
                    let current = elements_of(&owner.link.state(), key.property);
                    let previous = match self.context.collection(&key).and_then(|c| c.snapshot.clone()) {
                        Some(snapshot) => snapshot,
                        None => owner
                            .loaded_state
                            .as_ref()
                            .map(|state| elements_of(state, key.property))
                            .unwrap_or_default(),
                    };
                    (current, previous, owner.link.clone())
                }
                _ => continue,
            };
            let (added, removed) = diff_elements(&previous, &current);
            if !added.is_empty() || !removed.is_empty() {
                if let Some(id) = owner.identifier() {
                    stale_owners.push(EntityKey::new(owner.entity_name(), id));
                }
            }
            self.context.set_collection_snapshot(&key, current);
        }
        for key in stale_owners {
            let Some(region) = self.region(&key.entity_name) else {
                continue;
            };
            if let Err(e) = region.evict(&key.cache_key()).await {
                warn!("Cache evict of {} failed: {}", key, e);
            }
            self.register_cache_evict(&key);
        }
        self.factory.statistics.flushed();
        debug!("Flushed session: {} entities managed", self.context.len());
    }

    fn stale(&self, meta: &EntityMetadata, id: &Identifier) -> AppError {
        self.factory.statistics.optimistic_failure();
        if meta.is_versioned() {
            AppError::StaleObjectState {
                entity: meta.name.clone(),
                id: id.to_string(),
            }
        } else {
            AppError::StaleState(format!(
                "Row of {}#{} was updated or deleted by another transaction",
                meta.name, id
            ))
        }
    }

    fn register_cache_put(
        &mut self,
        meta: &EntityMetadata,
        key: &EntityKey,
        version: Option<i64>,
        state: &EntityState,
    ) {
        match CacheEntry::disassemble(meta, version, state) {
            Ok(entry) => self.queue.register_completion(CompletionProcess::CachePut {
                entity_name: meta.name.clone(),
                key: key.cache_key(),
                entry,
            }),
            Err(e) => {
                debug!("Not caching {}: {}", key, e);
                self.register_cache_evict(key);
            }
        }
    }

    fn register_cache_evict(&mut self, key: &EntityKey) {
        self.queue.register_completion(CompletionProcess::CacheEvict {
            entity_name: key.entity_name.clone(),
            key: key.cache_key(),
        });
    }
}
