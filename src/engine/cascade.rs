// Cascades - persist, remove and detach along associations
// Also the flush-time cascade: persist-on-flush and orphan removal

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::core::{CollectionKey, EntityStatus, Identifier, Value};
use crate::engine::actions::{EntityDeleteAction, EntityInsertAction};
use crate::engine::dirty_check::{diff_elements, elements_of};
use crate::engine::entity_entry::EntityEntry;
use crate::engine::listeners::EntityEvent;
use crate::engine::session::Session;
use crate::engine::sql;
use crate::error::{AppError, AppResult};
use crate::infrastructure::id_generator::uuid_identifier;
use crate::mapping::{CascadeType, EntityLink, EntityMetadata, IdStrategy};

/// Role name of a collection, `Entity.property`
pub(crate) fn collection_role(meta: &EntityMetadata, index: usize) -> String {
    format!("{}.{}", meta.name, meta.properties[index].name)
}

impl Session {
    pub(crate) fn persist_entity<'a>(&'a mut self, link: EntityLink) -> BoxFuture<'a, AppResult<()>> {
        Box::pin(async move {
            if !self.context.visit(link.instance_id()) {
                return Ok(());
            }
            match self.context.status_of(&link) {
                Some(EntityStatus::Deleted) => {
                    // persisting a removed instance cancels the removal
                    debug!("Un-scheduling deletion of {:?}", link);
                    self.queue.unschedule_deletion(link.instance_id());
                    if let Some(entry) = self.context.entry_mut(link.instance_id()) {
                        entry.status = EntityStatus::Managed;
                        entry.deleted_state = None;
                    }
                    self.cascade_after_persist(&link).await
                }
                Some(EntityStatus::Gone) => Err(AppError::InvalidArgument(format!(
                    "{:?} was deleted and cannot be persisted again",
                    link
                ))),
                Some(_) => self.cascade_after_persist(&link).await,
                None => {
                    if self.is_detached(&link).await? {
                        return Err(AppError::PersistentObject(format!(
                            "Detached instance {:?} passed to persist",
                            link
                        )));
                    }
                    self.save_transient(link).await
                }
            }
        })
    }

    async fn cascade_after_persist(&mut self, link: &EntityLink) -> AppResult<()> {
        let meta = self.metadata(link.entity_name())?;
        self.cascade_to_one(link, &meta, CascadeType::Persist).await?;
        self.cascade_collections(link, &meta, CascadeType::Persist).await
    }

    async fn save_transient(&mut self, link: EntityLink) -> AppResult<()> {
        let meta = self.metadata(link.entity_name())?;
        let factory = self.factory.clone();

        let mut state = link.state();
        if factory
            .listeners
            .fire(EntityEvent::PreInsert, &meta, link.identifier().as_ref(), &mut state)
            .await?
        {
            link.apply_state(&state)?;
        }

        // targets of to-one cascades are saved first so their keys exist
        self.cascade_to_one(&link, &meta, CascadeType::Persist).await?;

        if let Some(id) = self.generate_identifier(&meta, &link).await? {
            link.set_identifier(id);
        }

        let mut state = link.state();
        let version = match meta.version {
            Some(index) => {
                let version = state.integer(index)?.unwrap_or(0);
                state.set(index, Value::Integer(version));
                Some(version)
            }
            None => None,
        };

        let mut entry = EntityEntry::new(link.clone(), EntityStatus::Saving);
        entry.version = version;
        self.context.add_entry(entry)?;
        let instance = link.instance_id();
        for (index, _) in meta.collections() {
            self.context
                .add_collection(CollectionKey::new(instance, index), collection_role(&meta, index), None);
        }
        trace!("Saving {:?}", link);

        let dependencies = self.nullify_transient_references(&meta, &mut state).await?;
        let action = EntityInsertAction {
            link: link.clone(),
            entity_name: link.entity_name(),
            table: meta.table.clone(),
            state,
            early: meta.id.strategy == IdStrategy::Identity,
        };
        if dependencies.is_empty() {
            self.add_resolved_insert(action).await?;
        } else {
            self.queue.unresolved.add(action, dependencies);
        }

        self.cascade_collections(&link, &meta, CascadeType::Persist).await
    }

    async fn generate_identifier(
        &mut self,
        meta: &EntityMetadata,
        link: &EntityLink,
    ) -> AppResult<Option<Identifier>> {
        let id = match meta.id.strategy {
            IdStrategy::Assigned => Some(link.identifier().ok_or_else(|| {
                AppError::IdGenerationError(format!(
                    "Identifiers of '{}' must be assigned before persist",
                    meta.name
                ))
            })?),
            IdStrategy::Increment => {
                if !self.factory.increments.is_seeded(&meta.table) {
                    let rows = self.fetch(&sql::max_id(meta)).await?;
                    let max = rows
                        .first()
                        .and_then(|row| row.get_index(0))
                        .and_then(|value| value.as_i64())
                        .unwrap_or(0);
                    self.factory.increments.seed(&meta.table, max)?;
                }
                Some(Identifier::Integer(self.factory.increments.next_id(&meta.table)?))
            }
            IdStrategy::Snowflake => Some(Identifier::Integer(self.factory.snowflake.next_id()?)),
            IdStrategy::Uuid => Some(uuid_identifier()),
            IdStrategy::Identity => None,
        };
        Ok(id)
    }

    /// Queue an insert whose references can all be written, then release
    /// the inserts that were only waiting for it
    pub(crate) fn add_resolved_insert<'a>(
        &'a mut self,
        action: EntityInsertAction,
    ) -> BoxFuture<'a, AppResult<()>> {
        Box::pin(async move {
            let instance = action.instance();
            let meta = self.metadata(action.entity_name)?;
            let loaded = action.state.clone();

            if action.early {
                // queued inserts go first so the generated key follows them
                self.execute_inserts().await?;
                self.execute_insert(action).await?;
            } else {
                self.queue.insertions.push(action);
            }

            if let Some(entry) = self.context.entry_mut(instance) {
                if meta.mutable {
                    entry.status = EntityStatus::Managed;
                    entry.loaded_state = Some(loaded);
                } else {
                    entry.status = EntityStatus::ReadOnly;
                }
            }

            for dependent in self.queue.unresolved.resolve_dependents(instance) {
                self.add_resolved_insert(dependent).await?;
            }
            Ok(())
        })
    }

    pub(crate) fn remove_entity<'a>(
        &'a mut self,
        link: EntityLink,
        orphan: bool,
    ) -> BoxFuture<'a, AppResult<()>> {
        Box::pin(async move {
            let instance = link.instance_id();
            if !self.context.visit(instance) {
                return Ok(());
            }
            let Some(entry) = self.context.entry_for(&link).cloned() else {
                if self.is_detached(&link).await? {
                    return Err(AppError::InvalidArgument(format!(
                        "Removing a detached instance {:?}",
                        link
                    )));
                }
                trace!("Ignoring remove of transient {:?}", link);
                return Ok(());
            };

            match entry.status {
                EntityStatus::Deleted | EntityStatus::Gone => return Ok(()),
                EntityStatus::Saving => {
                    self.queue.unresolved.remove(instance);
                    self.context.remove_entry(instance);
                    return Ok(());
                }
                _ => {}
            }
            let meta = self.metadata(entry.entity_name)?;
            let id = entry.id.clone().ok_or_else(|| {
                AppError::Internal(format!("Managed {:?} has no identifier", link))
            })?;

            let factory = self.factory.clone();
            let mut state = link.state();
            factory
                .listeners
                .fire(EntityEvent::PreDelete, &meta, Some(&id), &mut state)
                .await?;

            self.cascade_collections(&link, &meta, CascadeType::Remove).await?;

            let loaded = entry.loaded_state.clone().unwrap_or(state);
            // an orphan without collections can go before everything else
            let orphan_first = orphan && !meta.has_collections();
            if let Some(entry) = self.context.entry_mut(instance) {
                entry.status = EntityStatus::Deleted;
            }
            let deleted = if orphan_first {
                loaded.clone()
            } else {
                self.deleted_state(&meta, &loaded)
            };
            if let Some(entry) = self.context.entry_mut(instance) {
                entry.loaded_state = Some(loaded);
                entry.deleted_state = Some(deleted);
            }

            let action = EntityDeleteAction {
                link: link.clone(),
                entity_name: link.entity_name(),
                table: meta.table.clone(),
                id,
                orphan,
            };
            if orphan_first {
                self.queue.orphan_removals.push(action);
            } else {
                self.queue.deletions.push(action);
            }
            debug!("Scheduled deletion of {:?}", link);

            self.cascade_to_one(&link, &meta, CascadeType::Remove).await
        })
    }

    pub(crate) fn detach_entity<'a>(&'a mut self, link: EntityLink) -> BoxFuture<'a, AppResult<()>> {
        Box::pin(async move {
            let instance = link.instance_id();
            if !self.context.visit(instance) || !self.context.contains_instance(&link) {
                return Ok(());
            }
            let meta = self.metadata(link.entity_name())?;
            self.queue.remove_actions_for(instance);
            self.context.remove_entry(instance);
            trace!("Detached {:?}", link);

            self.cascade_to_one(&link, &meta, CascadeType::Detach).await?;
            self.cascade_collections(&link, &meta, CascadeType::Detach).await
        })
    }

    /// Merge cascades are applied while merge copies values
    fn cascade_one<'a>(
        &'a mut self,
        cascade: CascadeType,
        target: EntityLink,
    ) -> BoxFuture<'a, AppResult<()>> {
        match cascade {
            CascadeType::Persist => self.persist_entity(target),
            CascadeType::Remove => self.remove_entity(target, false),
            CascadeType::Refresh => self.refresh_entity(target),
            CascadeType::Detach => self.detach_entity(target),
            CascadeType::Merge => Box::pin(async { Ok(()) }),
        }
    }

    pub(crate) async fn cascade_to_one(
        &mut self,
        link: &EntityLink,
        meta: &EntityMetadata,
        cascade: CascadeType,
    ) -> AppResult<()> {
        let state = link.state();
        let targets: Vec<EntityLink> = meta
            .many_to_ones()
            .filter(|(_, property)| property.cascade_style().includes(cascade))
            .filter_map(|(index, _)| state.get(index).as_reference().cloned())
            .collect();
        self.cascade_all(cascade, targets).await
    }

    pub(crate) async fn cascade_collections(
        &mut self,
        link: &EntityLink,
        meta: &EntityMetadata,
        cascade: CascadeType,
    ) -> AppResult<()> {
        let state = link.state();
        let targets: Vec<EntityLink> = meta
            .collections()
            .filter(|(_, mapping)| mapping.cascade.includes(cascade))
            .flat_map(|(index, _)| elements_of(&state, index))
            .collect();
        self.cascade_all(cascade, targets).await
    }

    async fn cascade_all(&mut self, cascade: CascadeType, targets: Vec<EntityLink>) -> AppResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        self.context.cascade_level += 1;
        let mut result = Ok(());
        for target in targets {
            result = self.cascade_one(cascade, target).await;
            if result.is_err() {
                break;
            }
        }
        self.context.cascade_level -= 1;
        result
    }

    /// First step of a flush: delete orphans, then persist everything
    /// reachable through persist cascades
    pub(crate) async fn cascade_on_flush(&mut self) -> AppResult<()> {
        let instances = self.context.entry_ids();

        self.context.reset_visited();
        for &instance in &instances {
            let Some(entry) = self.context.entry(instance) else {
                continue;
            };
            if !matches!(entry.status, EntityStatus::Managed | EntityStatus::ReadOnly) {
                continue;
            }
            let link = entry.link.clone();
            let meta = self.metadata(link.entity_name())?;
            self.delete_orphans(&link, &meta).await?;
        }

        self.context.reset_visited();
        for &instance in &instances {
            let Some(entry) = self.context.entry(instance) else {
                continue;
            };
            if !entry.status.is_live() {
                continue;
            }
            let link = entry.link.clone();
            self.cascade_after_persist(&link).await?;
        }
        self.context.reset_visited();
        Ok(())
    }

    async fn delete_orphans(&mut self, link: &EntityLink, meta: &EntityMetadata) -> AppResult<()> {
        let state = link.state();
        for (index, mapping) in meta.collections() {
            if !mapping.orphan_removal {
                continue;
            }
            let key = CollectionKey::new(link.instance_id(), index);
            let Some(snapshot) = self.context.collection(&key).and_then(|c| c.snapshot.clone()) else {
                continue;
            };
            let (_, removed) = diff_elements(&snapshot, &elements_of(&state, index));
            for orphan in removed {
                let live = matches!(
                    self.context.status_of(&orphan),
                    Some(EntityStatus::Managed | EntityStatus::ReadOnly)
                );
                if live {
                    debug!("Deleting orphan {:?} of {}", orphan, collection_role(meta, index));
                    self.remove_entity(orphan, true).await?;
                }
            }
        }
        Ok(())
    }
}
