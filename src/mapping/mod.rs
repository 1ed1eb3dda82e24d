// Mapping layer - entity contract, mapping metadata and the metamodel lookup
pub mod entity;
pub mod metadata;
pub mod metamodel;
pub mod schema;

pub use entity::{Entity, EntityLink, EntityRef, EntityState, ManagedEntity};
pub use metadata::{
    CascadeStyle, CascadeType, CollectionKind, CollectionMapping, EntityMetadata,
    EntityMetadataBuilder, IdMapping, IdStrategy, PropertyKind, PropertyMapping, SqlType,
};
pub use metamodel::Metamodel;
