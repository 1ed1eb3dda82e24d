// Metamodel - registry of entity mappings, looked up by entity name

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::Identifier;
use crate::error::{AppError, AppResult};
use crate::mapping::entity::{Entity, EntityLink, EntityRef, EntityState};
use crate::mapping::metadata::{CollectionKind, EntityMetadata, PropertyKind};

/// Builds a fresh instance of a registered type from its state
pub type Instantiator = fn(Option<Identifier>, &EntityState) -> AppResult<EntityLink>;

fn instantiate_entity<T: Entity>(
    id: Option<Identifier>,
    state: &EntityState,
) -> AppResult<EntityLink> {
    let mut entity = T::from_state(state)?;
    if let Some(id) = id {
        entity.set_identifier(id);
    }
    Ok(EntityRef::new(entity).link())
}

#[derive(Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityMetadata>>,
    instantiators: HashMap<String, Instantiator>,
    registration_order: Vec<String>,
}

impl std::fmt::Debug for Metamodel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metamodel")
            .field("entities", &self.registration_order)
            .finish()
    }
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Entity>(&mut self, metadata: EntityMetadata) -> AppResult<()> {
        if metadata.name != T::entity_name() {
            return Err(AppError::MappingError(format!(
                "Mapping '{}' registered for type named '{}'",
                metadata.name,
                T::entity_name()
            )));
        }
        if self.entities.contains_key(&metadata.name) {
            return Err(AppError::MappingError(format!(
                "Entity '{}' is already mapped",
                metadata.name
            )));
        }
        debug!("Registering entity '{}' -> table '{}'", metadata.name, metadata.table);
        let name = metadata.name.clone();
        self.instantiators.insert(name.clone(), instantiate_entity::<T>);
        self.entities.insert(name.clone(), Arc::new(metadata));
        self.registration_order.push(name);
        Ok(())
    }

    /// Builder-style registration
    pub fn with<T: Entity>(mut self, metadata: EntityMetadata) -> AppResult<Self> {
        self.register::<T>(metadata)?;
        Ok(self)
    }

    pub fn metadata(&self, entity_name: &str) -> AppResult<Arc<EntityMetadata>> {
        self.entities
            .get(entity_name)
            .cloned()
            .ok_or_else(|| AppError::MappingError(format!("Unknown entity '{}'", entity_name)))
    }

    pub fn contains(&self, entity_name: &str) -> bool {
        self.entities.contains_key(entity_name)
    }

    pub fn instantiate(
        &self,
        entity_name: &str,
        id: Option<Identifier>,
        state: &EntityState,
    ) -> AppResult<EntityLink> {
        let instantiate = self.instantiators.get(entity_name).ok_or_else(|| {
            AppError::MappingError(format!("Unknown entity '{}'", entity_name))
        })?;
        instantiate(id, state)
    }

    /// Entity names in registration order
    pub fn entity_names(&self) -> &[String] {
        &self.registration_order
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<EntityMetadata>> + '_ {
        self.registration_order
            .iter()
            .filter_map(|name| self.entities.get(name).cloned())
    }

    /// Cross-entity checks that a single mapping cannot perform on its own
    pub fn validate(&self) -> AppResult<()> {
        for meta in self.iter() {
            for property in &meta.properties {
                let Some(target) = property.target() else {
                    continue;
                };
                let target_meta = self.metadata(target).map_err(|_| {
                    AppError::MappingError(format!(
                        "Association '{}.{}' targets unmapped entity '{}'",
                        meta.name, property.name, target
                    ))
                })?;

                if let PropertyKind::Collection(mapping) = &property.kind {
                    if let CollectionKind::OneToMany {
                        key_column,
                        inverse: true,
                    } = &mapping.kind
                    {
                        let owned_by_element = target_meta.many_to_ones().any(|(_, p)| {
                            p.column.as_deref() == Some(key_column.as_str())
                                && p.target() == Some(meta.name.as_str())
                        });
                        if !owned_by_element {
                            return Err(AppError::MappingError(format!(
                                "Inverse collection '{}.{}' needs a many-to-one on '{}' stored in '{}'",
                                meta.name, property.name, target, key_column
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::metadata::{PropertyMapping, SqlType};

    struct Note {
        id: Option<i64>,
        body: String,
    }

    impl Entity for Note {
        fn entity_name() -> &'static str {
            "Note"
        }
        fn identifier(&self) -> Option<Identifier> {
            self.id.map(Identifier::Integer)
        }
        fn set_identifier(&mut self, id: Identifier) {
            self.id = id.as_i64();
        }
        fn to_state(&self) -> EntityState {
            EntityState::new().with(self.body.as_str())
        }
        fn from_state(state: &EntityState) -> AppResult<Self> {
            Ok(Self {
                id: None,
                body: state.required_text(0)?,
            })
        }
    }

    #[test]
    fn test_register_and_instantiate() {
        let meta = EntityMetadata::builder("Note", "notes")
            .basic("body", SqlType::Text)
            .build()
            .unwrap();
        let model = Metamodel::new().with::<Note>(meta).unwrap();

        let link = model
            .instantiate("Note", Some(Identifier::Integer(3)), &EntityState::new().with("hi"))
            .unwrap();
        assert_eq!(link.identifier(), Some(Identifier::Integer(3)));
        assert_eq!(link.downcast::<Note>().unwrap().read().body, "hi");
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let meta = EntityMetadata::builder("Memo", "memos").build().unwrap();
        assert!(Metamodel::new().with::<Note>(meta).is_err());
    }

    #[test]
    fn test_validate_unknown_target() {
        let meta = EntityMetadata::builder("Note", "notes")
            .property(PropertyMapping::many_to_one("owner", "Person"))
            .build()
            .unwrap();
        let model = Metamodel::new().with::<Note>(meta).unwrap();
        assert!(model.validate().is_err());
    }
}
