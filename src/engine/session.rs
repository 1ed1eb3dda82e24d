// Session - unit of work over one gateway
// Tracks managed instances, queues their SQL and writes it out at flush

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::core::{EntityKey, EntityStatus, FlushMode, Identifier, LockMode};
use crate::engine::action_queue::ActionQueue;
use crate::engine::actions::CompletionProcess;
use crate::engine::dirty_check::{diff_elements, elements_of, find_dirty};
use crate::engine::persistence_context::PersistenceContext;
use crate::engine::query::Query;
use crate::engine::session_factory::FactoryInner;
use crate::engine::sql;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{CacheRegion, ExecuteResult, Row, SqlGateway, Statement};
use crate::mapping::{Entity, EntityLink, EntityMetadata, EntityRef};

pub struct Session {
    pub(crate) factory: Arc<FactoryInner>,
    pub(crate) gateway: Box<dyn SqlGateway>,
    pub(crate) context: PersistenceContext,
    pub(crate) queue: ActionQueue,
    pub(crate) flush_mode: FlushMode,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("entities", &self.context.len())
            .field("flush_mode", &self.flush_mode)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(factory: Arc<FactoryInner>, gateway: Box<dyn SqlGateway>) -> Self {
        factory.statistics.session_opened();
        Self {
            flush_mode: factory.config.flush_mode,
            factory,
            gateway,
            context: PersistenceContext::new(),
            queue: ActionQueue::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closed {
            Err(AppError::SessionClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn metadata(&self, entity_name: &str) -> AppResult<Arc<EntityMetadata>> {
        self.factory.metamodel.metadata(entity_name)
    }

    /// Cache region of an entity when second-level caching applies to it
    pub(crate) fn region(&self, entity_name: &str) -> Option<Arc<dyn CacheRegion>> {
        if !self.factory.config.second_level_cache {
            return None;
        }
        self.factory.regions.get(entity_name).cloned()
    }

    pub(crate) async fn execute(&mut self, statement: &Statement) -> AppResult<ExecuteResult> {
        self.factory.statistics.statement_prepared();
        self.gateway.execute(statement).await
    }

    pub(crate) async fn fetch(&mut self, statement: &Statement) -> AppResult<Vec<Row>> {
        self.factory.statistics.statement_prepared();
        self.gateway.query(statement).await
    }

    /// Run a public operation: tracks nesting and, at the outermost level,
    /// fails when inserts are still waiting on unsaved references.
    fn top_level<R>(&mut self, result: AppResult<R>, check_unresolved: bool) -> AppResult<R> {
        let outermost = self.context.is_top_level();
        self.context.end_operation();
        match result {
            Ok(value) if outermost && check_unresolved => {
                self.check_no_unresolved_inserts().map(|_| value)
            }
            other => other,
        }
    }

    fn check_no_unresolved_inserts(&mut self) -> AppResult<()> {
        if self.queue.unresolved.is_empty() {
            return Ok(());
        }
        let description = self.queue.unresolved.describe();
        for action in self.queue.unresolved.drain() {
            self.context.remove_entry(action.instance());
        }
        Err(AppError::TransientPropertyValue(description))
    }

    // ---- lifecycle operations ----

    /// Make a transient instance managed; its insert runs at the next flush
    #[instrument(skip_all, fields(entity = T::entity_name()))]
    pub async fn persist<T: Entity>(&mut self, entity: &EntityRef<T>) -> AppResult<()> {
        self.ensure_open()?;
        self.context.begin_operation();
        let result = self.persist_entity(entity.link()).await;
        self.top_level(result, true)
    }

    /// Copy the state of a detached or transient instance onto a managed one
    #[instrument(skip_all, fields(entity = T::entity_name()))]
    pub async fn merge<T: Entity>(&mut self, entity: &EntityRef<T>) -> AppResult<EntityRef<T>> {
        self.ensure_open()?;
        self.context.begin_operation();
        let result = self.merge_entity(entity.link()).await;
        let link = self.top_level(result, true)?;
        link.downcast::<T>()
    }

    /// Schedule a managed instance for deletion
    #[instrument(skip_all, fields(entity = T::entity_name()))]
    pub async fn remove<T: Entity>(&mut self, entity: &EntityRef<T>) -> AppResult<()> {
        self.ensure_open()?;
        self.context.begin_operation();
        let result = self.remove_entity(entity.link(), false).await;
        self.top_level(result, false)
    }

    /// Instance with the given identifier, or None when no row exists
    pub async fn find<T: Entity>(
        &mut self,
        id: impl Into<Identifier>,
    ) -> AppResult<Option<EntityRef<T>>> {
        self.ensure_open()?;
        self.context.begin_operation();
        let result = self
            .load_entity(T::entity_name().to_string(), id.into(), None)
            .await;
        match self.top_level(result, false)? {
            Some(link) => link.downcast::<T>().map(Some),
            None => Ok(None),
        }
    }

    /// Like `find`, but a missing row is an error
    pub async fn load<T: Entity>(&mut self, id: impl Into<Identifier>) -> AppResult<EntityRef<T>> {
        let id = id.into();
        self.find::<T>(id.clone()).await?.ok_or_else(|| {
            AppError::ObjectNotFound(EntityKey::new(T::entity_name(), id).to_string())
        })
    }

    /// Re-read a managed instance from the database, discarding local changes
    pub async fn refresh<T: Entity>(&mut self, entity: &EntityRef<T>) -> AppResult<()> {
        self.ensure_open()?;
        let link = entity.link();
        if !self.context.contains_instance(&link) {
            return Err(AppError::InvalidArgument(format!(
                "{:?} is not associated with the session",
                link
            )));
        }
        self.context.begin_operation();
        let result = self.refresh_entity(link).await;
        self.top_level(result, false)
    }

    /// Stop tracking an instance; pending changes to it are dropped
    pub async fn detach<T: Entity>(&mut self, entity: &EntityRef<T>) -> AppResult<()> {
        self.ensure_open()?;
        self.context.begin_operation();
        let result = self.detach_entity(entity.link()).await;
        self.top_level(result, false)
    }

    /// True for a managed instance that is not scheduled for deletion
    pub fn contains<T: Entity>(&self, entity: &EntityRef<T>) -> bool {
        matches!(
            self.context.status_of(&entity.link()),
            Some(status) if !status.is_deleted_or_gone()
        )
    }

    pub fn status_of<T: Entity>(&self, entity: &EntityRef<T>) -> Option<EntityStatus> {
        self.context.status_of(&entity.link())
    }

    /// Version the session last read or wrote for a managed instance
    pub fn version_of<T: Entity>(&self, entity: &EntityRef<T>) -> Option<i64> {
        self.context.entry_for(&entity.link()).and_then(|e| e.version)
    }

    /// Number of instances associated with the session
    pub fn entity_count(&self) -> usize {
        self.context.len()
    }

    pub fn set_read_only<T: Entity>(&mut self, entity: &EntityRef<T>, read_only: bool) -> AppResult<()> {
        self.ensure_open()?;
        let link = entity.link();
        let entity_name = self
            .context
            .entry_for(&link)
            .map(|e| e.entity_name)
            .ok_or_else(|| AppError::InvalidArgument(format!("{:?} is not managed", link)))?;
        if !read_only && !self.metadata(entity_name)?.mutable {
            return Err(AppError::InvalidArgument(format!(
                "Instances of immutable entity '{}' are always read-only",
                entity_name
            )));
        }
        let entry = self
            .context
            .entry_mut(link.instance_id())
            .ok_or_else(|| AppError::InvalidArgument(format!("{:?} is not managed", link)))?;
        match (entry.status, read_only) {
            (EntityStatus::Managed, true) => {
                entry.status = EntityStatus::ReadOnly;
                entry.loaded_state = None;
            }
            (EntityStatus::ReadOnly, false) => {
                entry.status = EntityStatus::Managed;
                entry.loaded_state = Some(link.state());
            }
            (EntityStatus::Managed, false) | (EntityStatus::ReadOnly, true) => {}
            (status, _) => {
                return Err(AppError::InvalidArgument(format!(
                    "Cannot change read-only state of {:?} entity",
                    status
                )))
            }
        }
        Ok(())
    }

    pub fn is_read_only<T: Entity>(&self, entity: &EntityRef<T>) -> bool {
        self.context
            .entry_for(&entity.link())
            .map(|e| e.is_read_only())
            .unwrap_or(false)
    }

    /// Instances loaded from now on start out read-only
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.context.default_read_only = read_only;
    }

    /// Apply an optimistic lock to a managed instance
    pub async fn lock<T: Entity>(&mut self, entity: &EntityRef<T>, mode: LockMode) -> AppResult<()> {
        self.ensure_open()?;
        let link = entity.link();
        let entry = self
            .context
            .entry_for(&link)
            .cloned()
            .ok_or_else(|| AppError::InvalidArgument(format!("{:?} is not managed", link)))?;
        let meta = self.metadata(entry.entity_name)?;
        if mode != LockMode::None && !meta.is_versioned() {
            return Err(AppError::InvalidArgument(format!(
                "Optimistic lock on unversioned entity '{}'",
                meta.name
            )));
        }

        match mode {
            LockMode::None => {}
            LockMode::Read => {
                let Some(id) = entry.id.clone() else {
                    return Ok(());
                };
                let rows = self.fetch(&sql::select_version(&meta, &id)?).await?;
                let current = rows.first().and_then(|r| r.get_index(0)).and_then(|v| v.as_i64());
                if entry.exists_in_database && current != entry.version {
                    self.factory.statistics.optimistic_failure();
                    return Err(AppError::StaleObjectState {
                        entity: meta.name.clone(),
                        id: id.to_string(),
                    });
                }
            }
            LockMode::OptimisticForceIncrement => {}
        }

        if let Some(entry) = self.context.entry_mut(link.instance_id()) {
            entry.lock_mode = mode;
        }
        Ok(())
    }

    // ---- flushing ----

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.flush_mode = mode;
    }

    /// Write all pending changes. Outside a transaction the flush runs in its own,
    /// and a failure there rolls it back and clears the session.
    #[instrument(skip_all)]
    pub async fn flush(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        if self.gateway.in_transaction() {
            return self.flush_internal().await;
        }

        self.gateway.begin().await?;
        match self.flush_internal().await {
            Ok(()) => {
                self.gateway.commit().await?;
                self.after_transaction_completion(true).await;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.gateway.rollback().await {
                    warn!("Rollback after failed flush failed: {}", rollback);
                }
                self.after_transaction_completion(false).await;
                self.clear();
                Err(e)
            }
        }
    }

    /// Detach everything and drop pending actions
    pub fn clear(&mut self) {
        debug!("Clearing session with {} entities", self.context.len());
        self.context.clear();
        self.queue.clear();
    }

    /// Whether a flush would write anything, without scheduling work
    pub async fn is_dirty(&mut self) -> AppResult<bool> {
        self.ensure_open()?;
        if self.queue.has_any_queued_actions() {
            return Ok(true);
        }
        for instance in self.context.entry_ids() {
            let Some(entry) = self.context.entry(instance).cloned() else {
                continue;
            };
            if entry.status != EntityStatus::Managed {
                continue;
            }
            let meta = self.metadata(entry.entity_name)?;
            let current = entry.link.state();
            if entry.lock_mode == LockMode::OptimisticForceIncrement {
                return Ok(true);
            }
            if let Some(loaded) = &entry.loaded_state {
                if meta.mutable && !find_dirty(&meta, loaded, &current).is_empty() {
                    return Ok(true);
                }
            }
            for (index, mapping) in meta.collections() {
                if mapping.is_inverse() {
                    continue;
                }
                let key = crate::core::CollectionKey::new(instance, index);
                let elements = elements_of(&current, index);
                let changed = match self.context.collection(&key).and_then(|c| c.snapshot.as_ref()) {
                    Some(snapshot) => {
                        let (added, removed) = diff_elements(snapshot, &elements);
                        !added.is_empty() || !removed.is_empty()
                    }
                    None => !elements.is_empty(),
                };
                if changed {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // ---- queries ----

    pub fn query<T: Entity>(&self) -> Query<T> {
        Query::new()
    }

    /// Run a query; rows already managed resolve to the managed instances
    #[instrument(skip_all, fields(entity = T::entity_name()))]
    pub async fn list<T: Entity>(&mut self, query: &Query<T>) -> AppResult<Vec<EntityRef<T>>> {
        self.ensure_open()?;
        self.context.begin_operation();
        let result = self.list_links(T::entity_name(), |meta| query.to_statement(meta)).await;
        let links = self.top_level(result, false)?;
        links.iter().map(EntityLink::downcast::<T>).collect()
    }

    async fn list_links(
        &mut self,
        entity_name: &str,
        statement: impl FnOnce(&EntityMetadata) -> AppResult<Statement>,
    ) -> AppResult<Vec<EntityLink>> {
        let meta = self.metadata(entity_name)?;
        let spaces: HashSet<String> = [meta.table.clone()].into_iter().collect();
        self.auto_flush_if_required(&spaces).await?;

        let statement = statement(&meta)?;
        let rows = self.fetch(&statement).await?;
        self.factory.statistics.query_executed();

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let id_value = row
                .get(&meta.id.column)
                .cloned()
                .unwrap_or(crate::infrastructure::SqlValue::Null);
            let id = sql::identifier_from(&id_value)?;
            if let Some(link) = self.load_entity(meta.name.clone(), id, Some(row)).await? {
                results.push(link);
            }
        }
        Ok(results)
    }

    // ---- transactions ----

    pub fn is_transaction_active(&self) -> bool {
        self.gateway.in_transaction()
    }

    pub async fn begin_transaction(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        self.gateway.begin().await?;
        self.factory.statistics.transaction_started();
        debug!("Transaction started");
        Ok(())
    }

    /// Flush (unless the flush mode is manual) and commit.
    /// On failure the transaction is rolled back and the session cleared.
    #[instrument(skip_all)]
    pub async fn commit(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        if !self.gateway.in_transaction() {
            return Err(AppError::TransactionError(
                "No transaction in progress".to_string(),
            ));
        }

        if self.flush_mode != FlushMode::Manual {
            if let Err(e) = self.flush_internal().await {
                if let Err(rollback) = self.gateway.rollback().await {
                    warn!("Rollback after failed commit flush failed: {}", rollback);
                }
                self.after_transaction_completion(false).await;
                self.clear();
                return Err(e);
            }
        }

        if let Err(e) = self.gateway.commit().await {
            self.after_transaction_completion(false).await;
            self.clear();
            return Err(e);
        }
        self.factory.statistics.transaction_committed();
        self.after_transaction_completion(true).await;
        debug!("Transaction committed");
        Ok(())
    }

    /// Roll back and clear the session; its instances are detached
    pub async fn rollback(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        let result = self.gateway.rollback().await;
        self.after_transaction_completion(false).await;
        self.clear();
        debug!("Transaction rolled back");
        result
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Roll back any open transaction and release the session
    pub async fn close(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        if self.gateway.in_transaction() {
            info!("Closing session with an open transaction; rolling back");
            self.gateway.rollback().await?;
            self.after_transaction_completion(false).await;
        }
        self.clear();
        self.closed = true;
        self.factory.statistics.session_closed();
        Ok(())
    }

    /// Cache maintenance deferred until the transaction outcome is known
    pub(crate) async fn after_transaction_completion(&mut self, success: bool) {
        for process in self.queue.take_completion() {
            let (entity_name, key, put) = match process {
                CompletionProcess::CachePut {
                    entity_name,
                    key,
                    entry,
                } => (entity_name, key, Some(entry)),
                CompletionProcess::CacheEvict { entity_name, key } => (entity_name, key, None),
            };
            let Some(region) = self.region(&entity_name) else {
                continue;
            };
            let outcome = match (success, put) {
                (true, Some(entry)) => match entry.to_bytes() {
                    Ok(bytes) => {
                        let put = region.put(&key, bytes).await;
                        if put.is_ok() {
                            self.factory.statistics.cache_put();
                        }
                        put
                    }
                    Err(e) => Err(e),
                },
                _ => region.evict(&key).await,
            };
            if let Err(e) = outcome {
                warn!("Cache maintenance for {} failed: {}", key, e);
            }
        }
    }
}
