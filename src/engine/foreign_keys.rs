// Foreign keys - decides which references can be written yet
// Transient and still-saving targets are nulled or make an insert wait;
// deleted targets are nulled before their rows disappear

use std::collections::HashSet;

use crate::core::{EntityKey, EntityStatus, InstanceId, Value};
use crate::engine::dirty_check::elements_of;
use crate::engine::session::Session;
use crate::engine::sql;
use crate::error::{AppError, AppResult};
use crate::mapping::{EntityLink, EntityMetadata, EntityState};

impl Session {
    /// An instance unknown to the session that has no row in the database
    pub(crate) async fn is_transient(&mut self, link: &EntityLink) -> AppResult<bool> {
        if self.context.contains_instance(link) {
            return Ok(false);
        }
        let Some(id) = link.identifier() else {
            return Ok(true);
        };
        let meta = self.metadata(link.entity_name())?;
        if meta.id.strategy.is_generated() {
            return Ok(false);
        }
        let key = EntityKey::new(meta.name.clone(), id.clone());
        if self.context.get_entity(&key).is_some() {
            return Ok(false);
        }
        let rows = self.fetch(&sql::exists(&meta, &id)).await?;
        Ok(rows.is_empty())
    }

    /// An instance unknown to the session that represents an existing row
    pub(crate) async fn is_detached(&mut self, link: &EntityLink) -> AppResult<bool> {
        if self.context.contains_instance(link) {
            return Ok(false);
        }
        Ok(!self.is_transient(link).await?)
    }

    /// Whether a reference to `target` cannot be written as a foreign key yet
    async fn is_nullifiable(&mut self, target: &EntityLink) -> AppResult<bool> {
        match self.context.status_of(target) {
            Some(EntityStatus::Saving) => Ok(true),
            Some(status) => Ok(status.is_deleted_or_gone()),
            None => self.is_transient(target).await,
        }
    }

    /// Null nullable references that cannot be written yet. Returns the
    /// instances behind non-nullable ones, which the insert has to wait for.
    pub(crate) async fn nullify_transient_references(
        &mut self,
        meta: &EntityMetadata,
        state: &mut EntityState,
    ) -> AppResult<HashSet<InstanceId>> {
        let references: Vec<(usize, bool, EntityLink)> = meta
            .many_to_ones()
            .filter_map(|(index, property)| {
                state
                    .get(index)
                    .as_reference()
                    .map(|target| (index, property.nullable, target.clone()))
            })
            .collect();

        let mut dependencies = HashSet::new();
        for (index, nullable, target) in references {
            if !self.is_nullifiable(&target).await? {
                continue;
            }
            if nullable {
                state.set(index, Value::Null);
            } else {
                dependencies.insert(target.instance_id());
            }
        }
        Ok(dependencies)
    }

    /// Loaded state with nullable references to deleted instances nulled.
    /// Written before the delete so foreign key cycles can be broken.
    pub(crate) fn deleted_state(&self, meta: &EntityMetadata, loaded: &EntityState) -> EntityState {
        let mut deleted = loaded.clone();
        for (index, property) in meta.many_to_ones() {
            if !property.nullable {
                continue;
            }
            let is_deleted = loaded
                .get(index)
                .as_reference()
                .and_then(|target| self.context.status_of(target))
                .map(EntityStatus::is_deleted_or_gone)
                .unwrap_or(false);
            if is_deleted {
                deleted.set(index, Value::Null);
            }
        }
        deleted
    }

    /// Fail when a managed instance points at an instance that was never saved
    pub(crate) async fn check_references(
        &mut self,
        meta: &EntityMetadata,
        state: &EntityState,
    ) -> AppResult<()> {
        for (index, property) in meta.many_to_ones() {
            let Some(target) = state.get(index).as_reference().cloned() else {
                continue;
            };
            if self.is_transient(&target).await? {
                return Err(AppError::TransientObject(format!(
                    "{}.{} references an unsaved instance of '{}'; save it before flushing",
                    meta.name,
                    property.name,
                    target.entity_name()
                )));
            }
        }
        for (index, mapping) in meta.collections() {
            if mapping.is_inverse() {
                continue;
            }
            for element in elements_of(state, index) {
                if self.is_transient(&element).await? {
                    return Err(AppError::TransientObject(format!(
                        "{}.{} holds an unsaved instance of '{}'; save it before flushing",
                        meta.name, meta.properties[index].name, mapping.target
                    )));
                }
            }
        }
        Ok(())
    }
}
