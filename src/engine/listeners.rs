// Entity listeners - interceptor pattern for entity lifecycle events
// Pre-event listeners may change the state about to be written or veto the operation

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use crate::core::{Identifier, Value};
use crate::error::{AppError, AppResult};
use crate::mapping::{EntityMetadata, EntityState, PropertyKind, SqlType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityEvent {
    PreInsert,
    PostInsert,
    PreUpdate,
    PostUpdate,
    PreDelete,
    PostDelete,
    PostLoad,
}

impl EntityEvent {
    pub fn is_pre(self) -> bool {
        matches!(
            self,
            EntityEvent::PreInsert | EntityEvent::PreUpdate | EntityEvent::PreDelete
        )
    }
}

/// What a listener sees of the entity being processed
pub struct ListenerContext<'a> {
    pub event: EntityEvent,
    pub metadata: &'a EntityMetadata,
    pub id: Option<&'a Identifier>,
    pub state: &'a mut EntityState,
}

impl ListenerContext<'_> {
    /// Set a property by name; unknown names are a mapping error
    pub fn set(&mut self, property: &str, value: Value) -> AppResult<()> {
        let (index, _) = self.metadata.property(property)?;
        self.state.set(index, value);
        Ok(())
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.metadata
            .property_index(property)
            .map(|index| self.state.get(index))
    }
}

/// Reject the operation from a pre-event listener
pub fn veto(reason: impl Into<String>) -> AppResult<()> {
    Err(AppError::Validation(reason.into()))
}

#[async_trait]
pub trait EntityListener: Send + Sync {
    async fn on_event(&self, ctx: &mut ListenerContext<'_>) -> AppResult<()>;

    fn name(&self) -> &str;

    fn events(&self) -> Vec<EntityEvent>;
}

/// Listeners per entity name plus listeners for every entity
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    by_entity: HashMap<String, Vec<Arc<dyn EntityListener>>>,
    global: Vec<Arc<dyn EntityListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_name: &str, listener: Arc<dyn EntityListener>) {
        self.by_entity
            .entry(entity_name.to_string())
            .or_default()
            .push(listener);
    }

    pub fn register_global(&mut self, listener: Arc<dyn EntityListener>) {
        self.global.push(listener);
    }

    /// Entity names with at least one listener of their own
    pub fn registered_entities(&self) -> impl Iterator<Item = &str> {
        self.by_entity.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.by_entity.values().all(Vec::is_empty)
    }

    /// Run every listener for the event; returns true when the state was changed
    pub async fn fire(
        &self,
        event: EntityEvent,
        metadata: &EntityMetadata,
        id: Option<&Identifier>,
        state: &mut EntityState,
    ) -> AppResult<bool> {
        let listeners: Vec<&Arc<dyn EntityListener>> = self
            .global
            .iter()
            .chain(self.by_entity.get(&metadata.name).into_iter().flatten())
            .filter(|l| l.events().contains(&event))
            .collect();
        if listeners.is_empty() {
            return Ok(false);
        }

        let before = state.clone();
        let mut ctx = ListenerContext {
            event,
            metadata,
            id,
            state,
        };
        for listener in listeners {
            trace!("Listener '{}' on {:?} of {}", listener.name(), event, metadata.name);
            listener.on_event(&mut ctx).await.map_err(|e| match e {
                AppError::Validation(msg) => AppError::Validation(format!(
                    "{} vetoed by '{}': {}",
                    metadata.name,
                    listener.name(),
                    msg
                )),
                other => other,
            })?;
        }
        Ok(event.is_pre() && *ctx.state != before)
    }
}

/// Sets a timestamp property on insert and update
pub struct TimestampListener {
    property: String,
}

impl TimestampListener {
    pub fn new(property: &str) -> Self {
        Self {
            property: property.to_string(),
        }
    }
}

#[async_trait]
impl EntityListener for TimestampListener {
    async fn on_event(&self, ctx: &mut ListenerContext<'_>) -> AppResult<()> {
        let is_timestamp = ctx
            .metadata
            .property(&self.property)
            .map(|(_, p)| matches!(p.kind, PropertyKind::Basic(SqlType::Timestamp)))
            .unwrap_or(false);
        if is_timestamp {
            ctx.set(&self.property, Value::Timestamp(Utc::now()))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "timestamp_listener"
    }

    fn events(&self) -> Vec<EntityEvent> {
        vec![EntityEvent::PreInsert, EntityEvent::PreUpdate]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::library::{self, Author};
    use crate::mapping::EntityRef;

    struct RejectBlankNames;

    #[async_trait]
    impl EntityListener for RejectBlankNames {
        async fn on_event(&self, ctx: &mut ListenerContext<'_>) -> AppResult<()> {
            match ctx.get("name") {
                Some(Value::Text(name)) if name.trim().is_empty() => veto("name is blank"),
                _ => Ok(()),
            }
        }

        fn name(&self) -> &str {
            "reject_blank_names"
        }

        fn events(&self) -> Vec<EntityEvent> {
            vec![EntityEvent::PreInsert]
        }
    }

    #[tokio::test]
    async fn test_timestamp_listener_sets_property() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Author").unwrap();
        let mut registry = ListenerRegistry::new();
        registry.register("Author", Arc::new(TimestampListener::new("updated_at")));

        let mut state = EntityRef::new(Author::new("Pratchett")).link().state();
        let changed = registry
            .fire(EntityEvent::PreInsert, &meta, None, &mut state)
            .await
            .unwrap();
        assert!(changed);
        let index = meta.property_index("updated_at").unwrap();
        assert!(matches!(state.get(index), Value::Timestamp(_)));
    }

    #[tokio::test]
    async fn test_veto_becomes_validation_error() {
        let model = library::library_metamodel().unwrap();
        let meta = model.metadata("Author").unwrap();
        let mut registry = ListenerRegistry::new();
        registry.register_global(Arc::new(RejectBlankNames));

        let mut state = EntityRef::new(Author::new("  ")).link().state();
        let err = registry
            .fire(EntityEvent::PreInsert, &meta, None, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // post events never report changes
        let changed = registry
            .fire(EntityEvent::PostLoad, &meta, None, &mut state)
            .await
            .unwrap();
        assert!(!changed);
    }
}
