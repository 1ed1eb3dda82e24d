// Merge - copies detached or transient state onto managed instances
// A copy cache per top-level merge keeps shared and cyclic graphs consistent

use futures::future::BoxFuture;
use tracing::debug;

use crate::core::{EntityKey, Value};
use crate::engine::session::Session;
use crate::error::{AppError, AppResult};
use crate::mapping::{CascadeType, EntityLink, EntityMetadata, EntityState};

impl Session {
    pub(crate) fn merge_entity<'a>(&'a mut self, source: EntityLink) -> BoxFuture<'a, AppResult<EntityLink>> {
        Box::pin(async move {
            let source_instance = source.instance_id();
            if let Some(copy) = self.context.merge_copy(source_instance) {
                return Ok(copy);
            }
            let meta = self.metadata(source.entity_name())?;

            if let Some(status) = self.context.status_of(&source) {
                if status.is_deleted_or_gone() {
                    return Err(AppError::InvalidArgument(format!(
                        "Deleted instance {:?} passed to merge",
                        source
                    )));
                }
                // already managed: only its references need merging
                self.context.record_merge_copy(source_instance, source.clone());
                let state = source.state();
                let merged = self.merge_values(&meta, &state).await?;
                if merged != state {
                    source.apply_state(&merged)?;
                }
                return Ok(source);
            }

            let source_state = source.state();
            let managed = match source.identifier() {
                Some(id) => {
                    let key = EntityKey::new(meta.name.clone(), id);
                    match self.context.get_entity(&key) {
                        Some(existing) => Some(existing),
                        None => self.load_entity(key.entity_name, key.id, None).await?,
                    }
                }
                None => None,
            };

            match managed {
                Some(target) => {
                    if matches!(self.context.status_of(&target), Some(s) if s.is_deleted_or_gone()) {
                        return Err(AppError::InvalidArgument(format!(
                            "{:?} is scheduled for deletion and cannot receive merged state",
                            target
                        )));
                    }
                    self.check_merge_version(&meta, &source_state, &target)?;
                    self.context.record_merge_copy(source_instance, target.clone());
                    let merged = self.merge_values(&meta, &source_state).await?;
                    target.apply_state(&merged)?;
                    debug!("Merged detached state into {:?}", target);
                    Ok(target)
                }
                None => {
                    // transient, or detached with its row gone: persist a copy
                    let copy_id = if meta.id.strategy.is_generated() {
                        None
                    } else {
                        source.identifier()
                    };
                    let copy = self
                        .factory
                        .metamodel
                        .instantiate(&meta.name, copy_id, &source_state)?;
                    self.context.record_merge_copy(source_instance, copy.clone());

                    // to-one targets first, so the copy's insert can write its foreign keys
                    let references = self.merge_references(&meta, &source_state).await?;
                    let mut without_collections = references.clone();
                    for (index, _) in meta.collections() {
                        without_collections.set(index, Value::Collection(Vec::new()));
                    }
                    copy.apply_state(&without_collections)?;
                    self.persist_entity(copy.clone()).await?;

                    // elements merged now find the copy already managed
                    let merged = self.merge_collections(&meta, &references).await?;
                    copy.apply_state(&merged)?;
                    debug!("Merged transient {:?} as new instance", source);
                    Ok(copy)
                }
            }
        })
    }

    fn check_merge_version(
        &self,
        meta: &EntityMetadata,
        source_state: &EntityState,
        target: &EntityLink,
    ) -> AppResult<()> {
        let Some(index) = meta.version else {
            return Ok(());
        };
        let source_version = source_state.integer(index)?;
        let managed_version = self.context.entry_for(target).and_then(|e| e.version);
        if source_version.is_some() && source_version != managed_version {
            self.factory.statistics.optimistic_failure();
            return Err(AppError::StaleObjectState {
                entity: meta.name.clone(),
                id: target.identifier().map(|id| id.to_string()).unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Source state with references swapped for managed instances. Associations
    /// cascading merge are merged; the rest resolve to what the session holds.
    async fn merge_values(&mut self, meta: &EntityMetadata, state: &EntityState) -> AppResult<EntityState> {
        let merged = self.merge_references(meta, state).await?;
        self.merge_collections(meta, &merged).await
    }

    async fn merge_references(&mut self, meta: &EntityMetadata, state: &EntityState) -> AppResult<EntityState> {
        let mut merged = state.clone();
        for (index, property) in meta.many_to_ones() {
            let Value::Reference(target) = state.get(index) else {
                continue;
            };
            let target = target.clone();
            let resolved = if property.cascade_style().includes(CascadeType::Merge) {
                self.merge_entity(target).await?
            } else {
                self.resolve_managed(target).await?
            };
            merged.set(index, Value::Reference(resolved));
        }
        Ok(merged)
    }

    async fn merge_collections(&mut self, meta: &EntityMetadata, state: &EntityState) -> AppResult<EntityState> {
        let mut merged = state.clone();
        for (index, mapping) in meta.collections() {
            let Value::Collection(elements) = state.get(index) else {
                continue;
            };
            let elements = elements.clone();
            let cascade = mapping.cascade.includes(CascadeType::Merge);
            let mut resolved = Vec::with_capacity(elements.len());
            for element in elements {
                resolved.push(if cascade {
                    self.merge_entity(element).await?
                } else {
                    self.resolve_managed(element).await?
                });
            }
            merged.set(index, Value::Collection(resolved));
        }
        Ok(merged)
    }

    /// Managed instance for the same row, loading it if needed. Transient
    /// instances are returned as they are and rejected at flush.
    async fn resolve_managed(&mut self, link: EntityLink) -> AppResult<EntityLink> {
        if self.context.contains_instance(&link) {
            return Ok(link);
        }
        if let Some(copy) = self.context.merge_copy(link.instance_id()) {
            return Ok(copy);
        }
        let Some(key) = link.key() else {
            return Ok(link);
        };
        if let Some(existing) = self.context.get_entity(&key) {
            return Ok(existing);
        }
        let loaded = self.load_entity(key.entity_name, key.id, None).await?;
        Ok(loaded.unwrap_or(link))
    }
}
