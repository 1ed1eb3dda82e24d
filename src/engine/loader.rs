// Loader - two-phase entity loading through the identity map and second-level cache
// Phase one instantiates with null associations, phase two resolves them;
// instances become managed once the outermost load completes

use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use crate::core::{CollectionKey, EntityKey, EntityStatus, Identifier, Value};
use crate::engine::cascade::collection_role;
use crate::engine::dirty_check::elements_of;
use crate::engine::entity_entry::EntityEntry;
use crate::engine::listeners::EntityEvent;
use crate::engine::second_level_cache::{CacheEntry, CachedValue};
use crate::engine::session::Session;
use crate::engine::sql;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{Row, SqlValue};
use crate::mapping::{CascadeType, EntityLink, EntityMetadata, EntityState, PropertyKind};

/// A property value read from a row or cache entry, before associations are resolved
#[derive(Debug, Clone)]
enum Hydrated {
    Ready(Value),
    Reference(Identifier),
    Elements(Vec<Identifier>),
    /// Collection elements still to be read from the database
    Fetch,
}

fn hydrate_row(meta: &EntityMetadata, row: &Row) -> AppResult<Vec<Hydrated>> {
    meta.properties
        .iter()
        .map(|property| {
            let raw = property
                .column
                .as_deref()
                .and_then(|column| row.get(column))
                .unwrap_or(&SqlValue::Null);
            Ok(match &property.kind {
                PropertyKind::Basic(sql_type) => Hydrated::Ready(sql::column_value(*sql_type, raw)?),
                PropertyKind::ManyToOne { .. } => match raw {
                    SqlValue::Null => Hydrated::Ready(Value::Null),
                    value => Hydrated::Reference(sql::identifier_from(value)?),
                },
                PropertyKind::Collection(_) => Hydrated::Fetch,
            })
        })
        .collect()
}

fn hydrate_cached(meta: &EntityMetadata, entry: &CacheEntry) -> AppResult<Option<Vec<Hydrated>>> {
    if entry.state.len() != meta.properties.len() {
        return Ok(None);
    }
    entry
        .state
        .iter()
        .map(|cached| {
            Ok(match cached {
                CachedValue::Reference(id) => Hydrated::Reference(id.clone()),
                CachedValue::Collection(ids) => Hydrated::Elements(ids.clone()),
                other => Hydrated::Ready(CacheEntry::basic_value(other)?.unwrap_or(Value::Null)),
            })
        })
        .collect::<AppResult<Vec<_>>>()
        .map(Some)
}

fn ready_state(hydrated: &[Hydrated]) -> EntityState {
    hydrated
        .iter()
        .map(|h| match h {
            Hydrated::Ready(value) => value.clone(),
            _ => Value::Null,
        })
        .collect::<Vec<_>>()
        .into()
}

impl Session {
    /// Resolve an instance by key: identity map, then cache, then database.
    /// `row` is given when a query already read the instance's columns.
    pub(crate) fn load_entity<'a>(
        &'a mut self,
        entity_name: String,
        id: Identifier,
        row: Option<Row>,
    ) -> BoxFuture<'a, AppResult<Option<EntityLink>>> {
        Box::pin(async move {
            let key = EntityKey::new(entity_name, id);
            if let Some(existing) = self.context.get_entity(&key) {
                let deleted = self
                    .context
                    .status_of(&existing)
                    .map(EntityStatus::is_deleted_or_gone)
                    .unwrap_or(false);
                return Ok(if deleted { None } else { Some(existing) });
            }

            let meta = self.metadata(&key.entity_name)?;
            self.context.load_depth += 1;
            let result = self.load_from_source(&meta, &key, row).await;
            self.context.load_depth -= 1;

            if self.context.load_depth == 0 {
                match &result {
                    Ok(_) => self.finish_loads().await?,
                    Err(_) => self.discard_pending_loads(),
                }
            }
            result
        })
    }

    async fn load_from_source(
        &mut self,
        meta: &EntityMetadata,
        key: &EntityKey,
        row: Option<Row>,
    ) -> AppResult<Option<EntityLink>> {
        let (hydrated, from_cache) = match row {
            Some(row) => (hydrate_row(meta, &row)?, false),
            None => match self.read_from_cache(meta, key).await {
                Some(hydrated) => (hydrated, true),
                None => {
                    let rows = self.fetch(&sql::select_by_id(meta, &key.id)).await?;
                    self.factory.statistics.entity_fetched();
                    let Some(row) = rows.into_iter().next() else {
                        return Ok(None);
                    };
                    (hydrate_row(meta, &row)?, false)
                }
            },
        };

        let mut state = ready_state(&hydrated);
        let link = self
            .factory
            .metamodel
            .instantiate(&meta.name, Some(key.id.clone()), &state)?;
        let mut entry = EntityEntry::new(link.clone(), EntityStatus::Loading);
        entry.exists_in_database = true;
        entry.version = match meta.version {
            Some(index) => state.integer(index)?,
            None => None,
        };
        self.context.add_entry(entry)?;
        self.context.pending_loads.push((link.instance_id(), from_cache));
        trace!("Loading {}", key);

        self.resolve_associations(meta, &key.id, hydrated, &mut state).await?;
        link.apply_state(&state)?;
        Ok(Some(link))
    }

    async fn resolve_associations(
        &mut self,
        meta: &EntityMetadata,
        id: &Identifier,
        hydrated: Vec<Hydrated>,
        state: &mut EntityState,
    ) -> AppResult<()> {
        for (index, value) in hydrated.into_iter().enumerate() {
            let Some(target) = meta.properties[index].target().map(str::to_string) else {
                continue;
            };
            match value {
                Hydrated::Ready(_) => {}
                Hydrated::Reference(target_id) => {
                    let resolved = self.load_entity(target, target_id, None).await?;
                    state.set(index, resolved.map(Value::Reference).unwrap_or(Value::Null));
                }
                Hydrated::Elements(ids) => {
                    let elements = self.load_all(&target, ids).await?;
                    state.set(index, Value::Collection(elements));
                }
                Hydrated::Fetch => {
                    let ids = self.fetch_element_ids(meta, index, id).await?;
                    let elements = self.load_all(&target, ids).await?;
                    state.set(index, Value::Collection(elements));
                }
            }
        }
        Ok(())
    }

    async fn load_all(&mut self, entity_name: &str, ids: Vec<Identifier>) -> AppResult<Vec<EntityLink>> {
        let mut elements = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(link) = self.load_entity(entity_name.to_string(), id, None).await? {
                elements.push(link);
            }
        }
        Ok(elements)
    }

    async fn fetch_element_ids(
        &mut self,
        meta: &EntityMetadata,
        index: usize,
        owner_id: &Identifier,
    ) -> AppResult<Vec<Identifier>> {
        let PropertyKind::Collection(mapping) = &meta.properties[index].kind else {
            return Ok(Vec::new());
        };
        let target = self.metadata(&mapping.target)?;
        let rows = self
            .fetch(&sql::select_element_ids(mapping, &target, owner_id))
            .await?;
        rows.iter()
            .filter_map(|row| row.get_index(0))
            .map(sql::identifier_from)
            .collect()
    }

    async fn read_from_cache(&mut self, meta: &EntityMetadata, key: &EntityKey) -> Option<Vec<Hydrated>> {
        let region = self.region(&meta.name)?;
        let cache_key = key.cache_key();
        let bytes = match region.get(&cache_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.factory.statistics.cache_miss();
                return None;
            }
            Err(e) => {
                warn!("Cache read of {} failed: {}", key, e);
                return None;
            }
        };
        let hydrated = CacheEntry::from_bytes(&bytes).and_then(|entry| hydrate_cached(meta, &entry));
        match hydrated {
            Ok(Some(hydrated)) => {
                self.factory.statistics.cache_hit();
                trace!("Cache hit for {}", key);
                Some(hydrated)
            }
            Ok(None) | Err(_) => {
                debug!("Discarding unreadable cache entry {}", key);
                if let Err(e) = region.evict(&cache_key).await {
                    warn!("Cache evict of {} failed: {}", key, e);
                }
                self.factory.statistics.cache_miss();
                None
            }
        }
    }

    /// Make every instance of the outermost load managed
    async fn finish_loads(&mut self) -> AppResult<()> {
        let pending = std::mem::take(&mut self.context.pending_loads);
        let factory = self.factory.clone();
        for (instance, from_cache) in pending {
            let Some(entry) = self.context.entry(instance).cloned() else {
                continue;
            };
            let meta = self.metadata(entry.entity_name)?;
            let state = entry.link.state();
            let read_only = self.context.default_read_only || !meta.mutable;

            for (index, _) in meta.collections() {
                self.context.add_collection(
                    CollectionKey::new(instance, index),
                    collection_role(&meta, index),
                    Some(elements_of(&state, index)),
                );
            }
            if let Some(entry) = self.context.entry_mut(instance) {
                entry.status = if read_only {
                    EntityStatus::ReadOnly
                } else {
                    EntityStatus::Managed
                };
                entry.loaded_state = if read_only { None } else { Some(state.clone()) };
            }
            self.factory.statistics.entity_loaded();

            let mut event_state = state.clone();
            factory
                .listeners
                .fire(EntityEvent::PostLoad, &meta, entry.id.as_ref(), &mut event_state)
                .await?;

            if !from_cache {
                self.cache_after_load(&meta, &entry, &state).await;
            }
        }
        Ok(())
    }

    fn discard_pending_loads(&mut self) {
        for (instance, _) in std::mem::take(&mut self.context.pending_loads) {
            self.context.remove_entry(instance);
        }
    }

    /// Put a freshly loaded state unless the cache already holds this version or a newer one
    async fn cache_after_load(&mut self, meta: &EntityMetadata, entry: &EntityEntry, state: &EntityState) {
        let (Some(region), Some(key)) = (self.region(&meta.name), entry.key()) else {
            return;
        };
        let cache_key = key.cache_key();
        let cached = match CacheEntry::disassemble(meta, entry.version, state) {
            Ok(cached) => cached,
            Err(e) => {
                debug!("Not caching {}: {}", key, e);
                return;
            }
        };
        if let Ok(Some(existing)) = region.get(&cache_key).await {
            if let Ok(existing) = CacheEntry::from_bytes(&existing) {
                if existing.version >= cached.version {
                    return;
                }
            }
        }
        let put = match cached.to_bytes() {
            Ok(bytes) => region.put(&cache_key, bytes).await,
            Err(e) => Err(e),
        };
        match put {
            Ok(()) => self.factory.statistics.cache_put(),
            Err(e) => warn!("Cache put of {} failed: {}", key, e),
        }
    }

    /// Re-read an instance and the instances its refresh cascades reach
    pub(crate) fn refresh_entity<'a>(&'a mut self, link: EntityLink) -> BoxFuture<'a, AppResult<()>> {
        Box::pin(async move {
            let instance = link.instance_id();
            if !self.context.visit(instance) {
                return Ok(());
            }
            let Some(entry) = self.context.entry_for(&link).cloned() else {
                // unmanaged targets of a cascade are left alone
                return Ok(());
            };
            if entry.status.is_deleted_or_gone() {
                return Err(AppError::InvalidArgument(format!(
                    "{:?} is scheduled for deletion and cannot be refreshed",
                    link
                )));
            }
            let meta = self.metadata(entry.entity_name)?;
            let key = entry.key().ok_or_else(|| {
                AppError::InvalidArgument(format!("{:?} has not been saved", link))
            })?;

            self.cascade_to_one(&link, &meta, CascadeType::Refresh).await?;
            self.cascade_collections(&link, &meta, CascadeType::Refresh).await?;

            if let Some(region) = self.region(&meta.name) {
                if let Err(e) = region.evict(&key.cache_key()).await {
                    warn!("Cache evict of {} failed: {}", key, e);
                }
            }
            let rows = self.fetch(&sql::select_by_id(&meta, &key.id)).await?;
            let Some(row) = rows.first() else {
                return Err(AppError::ObjectNotFound(key.to_string()));
            };
            let hydrated = hydrate_row(&meta, row)?;
            let mut state = ready_state(&hydrated);
            self.resolve_associations(&meta, &key.id, hydrated, &mut state).await?;
            link.apply_state(&state)?;

            let version = match meta.version {
                Some(index) => state.integer(index)?,
                None => None,
            };
            for (index, _) in meta.collections() {
                self.context
                    .set_collection_snapshot(&CollectionKey::new(instance, index), elements_of(&state, index));
            }
            if let Some(entry) = self.context.entry_mut(instance) {
                entry.version = version;
                entry.lock_mode = Default::default();
                if entry.status != EntityStatus::ReadOnly {
                    entry.loaded_state = Some(state);
                }
            }
            debug!("Refreshed {}", key);
            Ok(())
        })
    }
}
