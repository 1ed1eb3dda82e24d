// Entity contract - how domain structs expose their state to the session
// Domain types implement Entity; the session only ever sees the type-erased EntityLink

use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::core::{EntityKey, Identifier, InstanceId, Value};
use crate::error::{AppError, AppResult};

/// A persistent domain type.
///
/// `to_state` returns property values in the order the entity's metadata
/// declares them (identifier excluded). Many-to-one fields are modelled as
/// `Option<EntityRef<T>>` and collections as `Vec<EntityRef<T>>`; while an
/// entity graph is being loaded, references are resolved after the instance
/// has been created, so `from_state` must accept null references.
pub trait Entity: Send + Sync + Sized + 'static {
    fn entity_name() -> &'static str;
    fn identifier(&self) -> Option<Identifier>;
    fn set_identifier(&mut self, id: Identifier);
    fn to_state(&self) -> EntityState;
    fn from_state(state: &EntityState) -> AppResult<Self>;
}

/// Shared handle to an entity instance. Mutations through `write()` are
/// picked up by dirty checking at the next flush.
pub struct EntityRef<T: Entity> {
    inner: Arc<RwLock<T>>,
}

impl<T: Entity> Clone for EntityRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> EntityRef<T> {
    pub fn new(entity: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Option<Identifier> {
        self.read().identifier()
    }

    /// Same instance, not merely the same row
    pub fn ptr_eq(&self, other: &EntityRef<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn link(&self) -> EntityLink {
        EntityLink(self.inner.clone())
    }

    pub fn from_link(link: &EntityLink) -> AppResult<Self> {
        let any = Arc::clone(&link.0).into_any();
        any.downcast::<RwLock<T>>()
            .map(|inner| Self { inner })
            .map_err(|_| {
                AppError::MappingError(format!(
                    "Instance of '{}' cannot be viewed as '{}'",
                    link.entity_name(),
                    T::entity_name()
                ))
            })
    }
}

impl<T: Entity + fmt::Debug> fmt::Debug for EntityRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Ok(entity) => f.debug_tuple("EntityRef").field(&*entity).finish(),
            Err(_) => write!(f, "EntityRef<{}>(<locked>)", T::entity_name()),
        }
    }
}

/// Object-safe view of an entity instance used by the engine
pub trait ManagedEntity: Send + Sync + 'static {
    fn entity_name(&self) -> &'static str;
    fn identifier(&self) -> Option<Identifier>;
    fn set_identifier(&self, id: Identifier);
    fn state(&self) -> EntityState;
    /// Replace the instance's property values, keeping its identifier
    fn apply_state(&self, state: &EntityState) -> AppResult<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> ManagedEntity for RwLock<T> {
    fn entity_name(&self) -> &'static str {
        T::entity_name()
    }

    fn identifier(&self) -> Option<Identifier> {
        self.read().unwrap_or_else(PoisonError::into_inner).identifier()
    }

    fn set_identifier(&self, id: Identifier) {
        self.write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_identifier(id);
    }

    fn state(&self) -> EntityState {
        self.read().unwrap_or_else(PoisonError::into_inner).to_state()
    }

    fn apply_state(&self, state: &EntityState) -> AppResult<()> {
        let mut replacement = T::from_state(state)?;
        let mut guard = self.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = guard.identifier() {
            replacement.set_identifier(id);
        }
        *guard = replacement;
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-erased shared instance
#[derive(Clone)]
pub struct EntityLink(Arc<dyn ManagedEntity>);

impl EntityLink {
    pub fn instance_id(&self) -> InstanceId {
        InstanceId(Arc::as_ptr(&self.0) as *const () as usize)
    }

    pub fn entity_name(&self) -> &'static str {
        self.0.entity_name()
    }

    pub fn identifier(&self) -> Option<Identifier> {
        self.0.identifier()
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.identifier()
            .map(|id| EntityKey::new(self.entity_name(), id))
    }

    pub fn same_instance(&self, other: &EntityLink) -> bool {
        self.instance_id() == other.instance_id()
    }

    /// Same instance, or two instances standing for the same row
    pub fn same_entity(&self, other: &EntityLink) -> bool {
        if self.same_instance(other) {
            return true;
        }
        if self.entity_name() != other.entity_name() {
            return false;
        }
        match (self.identifier(), other.identifier()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn downcast<T: Entity>(&self) -> AppResult<EntityRef<T>> {
        EntityRef::from_link(self)
    }

    pub(crate) fn set_identifier(&self, id: Identifier) {
        self.0.set_identifier(id)
    }

    pub(crate) fn state(&self) -> EntityState {
        self.0.state()
    }

    pub(crate) fn apply_state(&self, state: &EntityState) -> AppResult<()> {
        self.0.apply_state(state)
    }
}

impl fmt::Debug for EntityLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identifier() {
            Some(id) => write!(f, "{}#{}", self.entity_name(), id),
            None => write!(f, "{}{}", self.entity_name(), self.instance_id()),
        }
    }
}

/// Ordered property values of an entity, identifier excluded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
    values: Vec<Value>,
}

impl EntityState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&Value::Null)
    }

    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.values.len() {
            self.values.resize(index + 1, Value::Null);
        }
        self.values[index] = value;
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    fn mismatch(&self, index: usize, expected: &str) -> AppError {
        AppError::MappingError(format!(
            "Property {} expected {}, found {}",
            index,
            expected,
            self.get(index).type_name()
        ))
    }

    pub fn integer(&self, index: usize) -> AppResult<Option<i64>> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v)),
            _ => Err(self.mismatch(index, "integer")),
        }
    }

    pub fn real(&self, index: usize) -> AppResult<Option<f64>> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Real(v) => Ok(Some(*v)),
            Value::Integer(v) => Ok(Some(*v as f64)),
            _ => Err(self.mismatch(index, "real")),
        }
    }

    pub fn boolean(&self, index: usize) -> AppResult<Option<bool>> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Boolean(v) => Ok(Some(*v)),
            Value::Integer(v) => Ok(Some(*v != 0)),
            _ => Err(self.mismatch(index, "boolean")),
        }
    }

    pub fn text(&self, index: usize) -> AppResult<Option<String>> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            _ => Err(self.mismatch(index, "text")),
        }
    }

    /// Text property that must not be null
    pub fn required_text(&self, index: usize) -> AppResult<String> {
        self.text(index)?.ok_or_else(|| self.mismatch(index, "non-null text"))
    }

    pub fn blob(&self, index: usize) -> AppResult<Option<Vec<u8>>> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Blob(v) => Ok(Some(v.clone())),
            _ => Err(self.mismatch(index, "blob")),
        }
    }

    pub fn timestamp(&self, index: usize) -> AppResult<Option<DateTime<Utc>>> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Timestamp(v) => Ok(Some(*v)),
            _ => Err(self.mismatch(index, "timestamp")),
        }
    }

    pub fn reference<T: Entity>(&self, index: usize) -> AppResult<Option<EntityRef<T>>> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::Reference(link) => link.downcast::<T>().map(Some),
            _ => Err(self.mismatch(index, "reference")),
        }
    }

    /// Collection elements; a null value reads as an empty collection
    pub fn collection<T: Entity>(&self, index: usize) -> AppResult<Vec<EntityRef<T>>> {
        match self.get(index) {
            Value::Null => Ok(Vec::new()),
            Value::Collection(links) => links.iter().map(|l| l.downcast::<T>()).collect(),
            _ => Err(self.mismatch(index, "collection")),
        }
    }
}

impl From<Vec<Value>> for EntityState {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Widget {
        id: Option<i64>,
        label: String,
        parent: Option<EntityRef<Widget>>,
    }

    impl Entity for Widget {
        fn entity_name() -> &'static str {
            "Widget"
        }

        fn identifier(&self) -> Option<Identifier> {
            self.id.map(Identifier::Integer)
        }

        fn set_identifier(&mut self, id: Identifier) {
            self.id = id.as_i64();
        }

        fn to_state(&self) -> EntityState {
            EntityState::new()
                .with(self.label.as_str())
                .with(self.parent.as_ref())
        }

        fn from_state(state: &EntityState) -> AppResult<Self> {
            Ok(Self {
                id: None,
                label: state.required_text(0)?,
                parent: state.reference(1)?,
            })
        }
    }

    fn widget(label: &str) -> EntityRef<Widget> {
        EntityRef::new(Widget {
            id: None,
            label: label.to_string(),
            parent: None,
        })
    }

    #[test]
    fn test_link_identity() {
        let a = widget("a");
        let b = widget("b");
        assert!(a.link().same_instance(&a.clone().link()));
        assert!(!a.link().same_entity(&b.link()));

        a.write().id = Some(1);
        b.write().id = Some(1);
        assert!(a.link().same_entity(&b.link()));
        assert!(!a.link().same_instance(&b.link()));
    }

    #[test]
    fn test_downcast_round_trip() {
        let a = widget("a");
        let link = a.link();
        let back = link.downcast::<Widget>().unwrap();
        assert!(back.ptr_eq(&a));
    }

    #[test]
    fn test_apply_state_keeps_identifier() {
        let parent = widget("parent");
        let child = widget("child");
        child.write().id = Some(5);

        let state = EntityState::new().with("renamed").with(&parent);
        child.link().apply_state(&state).unwrap();

        let guard = child.read();
        assert_eq!(guard.id, Some(5));
        assert_eq!(guard.label, "renamed");
        assert!(guard.parent.as_ref().unwrap().ptr_eq(&parent));
    }

    #[test]
    fn test_state_accessors_report_type_mismatch() {
        let state = EntityState::new().with(3).with(Value::Null);
        assert_eq!(state.integer(0).unwrap(), Some(3));
        assert!(state.text(0).is_err());
        assert!(state.collection::<Widget>(1).unwrap().is_empty());
        assert_eq!(state.get(9), &Value::Null);
    }
}
