// Mapping metadata - how an entity type maps onto tables and columns
// Built in code through EntityMetadataBuilder; validated when registered with the Metamodel

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, AppResult};

static SQL_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static identifier pattern")
});

/// Check that a table, column or entity name is a plain SQL identifier
pub fn validate_identifier(kind: &str, name: &str) -> AppResult<()> {
    if SQL_IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(AppError::MappingError(format!(
            "Invalid {} name '{}'",
            kind, name
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Boolean,
    Integer,
    Real,
    Text,
    Blob,
    /// Stored as RFC 3339 text
    Timestamp,
}

impl SqlType {
    pub fn ddl(self) -> &'static str {
        match self {
            SqlType::Boolean | SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text | SqlType::Timestamp => "TEXT",
            SqlType::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeType {
    Persist,
    Merge,
    Remove,
    Refresh,
    Detach,
}

impl CascadeType {
    fn bit(self) -> u8 {
        match self {
            CascadeType::Persist => 1,
            CascadeType::Merge => 1 << 1,
            CascadeType::Remove => 1 << 2,
            CascadeType::Refresh => 1 << 3,
            CascadeType::Detach => 1 << 4,
        }
    }
}

/// Set of operations propagated along an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeStyle {
    bits: u8,
}

impl CascadeStyle {
    pub fn none() -> Self {
        Self { bits: 0 }
    }

    pub fn all() -> Self {
        Self { bits: 0b1_1111 }
    }

    pub fn of(types: &[CascadeType]) -> Self {
        types.iter().fold(Self::none(), |style, t| style.with(*t))
    }

    pub fn with(self, cascade: CascadeType) -> Self {
        Self {
            bits: self.bits | cascade.bit(),
        }
    }

    pub fn includes(self, cascade: CascadeType) -> bool {
        self.bits & cascade.bit() != 0
    }

    pub fn is_none(self) -> bool {
        self.bits == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// The application sets the identifier before persisting
    Assigned,
    /// max(id) + 1, kept in memory per session factory
    Increment,
    /// Time-ordered 64-bit identifiers
    Snowflake,
    /// Random UUID stored as text
    Uuid,
    /// Generated by the database on insert; forces an immediate insert
    Identity,
}

impl IdStrategy {
    pub fn is_generated(self) -> bool {
        !matches!(self, IdStrategy::Assigned)
    }
}

#[derive(Debug, Clone)]
pub struct IdMapping {
    pub column: String,
    pub sql_type: SqlType,
    pub strategy: IdStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    /// Foreign key column in the element table. An inverse collection is
    /// maintained by the element's own many-to-one.
    OneToMany { key_column: String, inverse: bool },
    /// Link rows in a join table
    ManyToMany {
        join_table: String,
        key_column: String,
        element_column: String,
    },
}

#[derive(Debug, Clone)]
pub struct CollectionMapping {
    pub target: String,
    pub kind: CollectionKind,
    pub cascade: CascadeStyle,
    pub orphan_removal: bool,
}

impl CollectionMapping {
    /// True when the collection itself issues no SQL
    pub fn is_inverse(&self) -> bool {
        matches!(self.kind, CollectionKind::OneToMany { inverse: true, .. })
    }

    pub fn query_space(&self, target_table: &str) -> String {
        match &self.kind {
            CollectionKind::OneToMany { .. } => target_table.to_string(),
            CollectionKind::ManyToMany { join_table, .. } => join_table.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PropertyKind {
    Basic(SqlType),
    ManyToOne { target: String, cascade: CascadeStyle },
    Collection(CollectionMapping),
}

#[derive(Debug, Clone)]
pub struct PropertyMapping {
    pub name: String,
    /// None for collections, which live in other tables
    pub column: Option<String>,
    pub kind: PropertyKind,
    pub nullable: bool,
    pub insertable: bool,
    pub updatable: bool,
}

impl PropertyMapping {
    pub fn basic(name: &str, sql_type: SqlType) -> Self {
        Self {
            name: name.to_string(),
            column: Some(name.to_string()),
            kind: PropertyKind::Basic(sql_type),
            nullable: true,
            insertable: true,
            updatable: true,
        }
    }

    /// Many-to-one stored in `<name>_id`
    pub fn many_to_one(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            column: Some(format!("{}_id", name)),
            kind: PropertyKind::ManyToOne {
                target: target.to_string(),
                cascade: CascadeStyle::none(),
            },
            nullable: true,
            insertable: true,
            updatable: true,
        }
    }

    pub fn one_to_many(name: &str, target: &str, key_column: &str) -> Self {
        Self::collection(
            name,
            target,
            CollectionKind::OneToMany {
                key_column: key_column.to_string(),
                inverse: false,
            },
        )
    }

    pub fn many_to_many(
        name: &str,
        target: &str,
        join_table: &str,
        key_column: &str,
        element_column: &str,
    ) -> Self {
        Self::collection(
            name,
            target,
            CollectionKind::ManyToMany {
                join_table: join_table.to_string(),
                key_column: key_column.to_string(),
                element_column: element_column.to_string(),
            },
        )
    }

    fn collection(name: &str, target: &str, kind: CollectionKind) -> Self {
        Self {
            name: name.to_string(),
            column: None,
            kind: PropertyKind::Collection(CollectionMapping {
                target: target.to_string(),
                kind,
                cascade: CascadeStyle::none(),
                orphan_removal: false,
            }),
            nullable: true,
            insertable: true,
            updatable: true,
        }
    }

    pub fn column(mut self, column: &str) -> Self {
        if self.column.is_some() {
            self.column = Some(column.to_string());
        }
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Written on insert, never updated
    pub fn immutable(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        match &mut self.kind {
            PropertyKind::ManyToOne { cascade, .. } => *cascade = style,
            PropertyKind::Collection(mapping) => mapping.cascade = style,
            PropertyKind::Basic(_) => {}
        }
        self
    }

    /// Mark a one-to-many as maintained by the element side
    pub fn inverse(mut self) -> Self {
        if let PropertyKind::Collection(CollectionMapping {
            kind: CollectionKind::OneToMany { inverse, .. },
            ..
        }) = &mut self.kind
        {
            *inverse = true;
        }
        self
    }

    pub fn orphan_removal(mut self) -> Self {
        if let PropertyKind::Collection(mapping) = &mut self.kind {
            mapping.orphan_removal = true;
        }
        self
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::Collection(_))
    }

    pub fn cascade_style(&self) -> CascadeStyle {
        match &self.kind {
            PropertyKind::ManyToOne { cascade, .. } => *cascade,
            PropertyKind::Collection(mapping) => mapping.cascade,
            PropertyKind::Basic(_) => CascadeStyle::none(),
        }
    }

    /// Target entity of an association property
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            PropertyKind::ManyToOne { target, .. } => Some(target),
            PropertyKind::Collection(mapping) => Some(&mapping.target),
            PropertyKind::Basic(_) => None,
        }
    }
}

/// Mapping of one entity type
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub id: IdMapping,
    pub properties: Vec<PropertyMapping>,
    pub version: Option<usize>,
    pub dynamic_update: bool,
    pub mutable: bool,
    pub cacheable: bool,
}

impl EntityMetadata {
    pub fn builder(name: &str, table: &str) -> EntityMetadataBuilder {
        EntityMetadataBuilder::new(name, table)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn property(&self, name: &str) -> AppResult<(usize, &PropertyMapping)> {
        self.property_index(name)
            .map(|i| (i, &self.properties[i]))
            .ok_or_else(|| {
                AppError::MappingError(format!(
                    "Entity '{}' has no property '{}'",
                    self.name, name
                ))
            })
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// Properties stored in this entity's own table, with their positions
    pub fn column_properties(&self) -> impl Iterator<Item = (usize, &PropertyMapping)> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.column.is_some())
    }

    pub fn collections(&self) -> impl Iterator<Item = (usize, &CollectionMapping)> {
        self.properties
            .iter()
            .enumerate()
            .filter_map(|(i, p)| match &p.kind {
                PropertyKind::Collection(mapping) => Some((i, mapping)),
                _ => None,
            })
    }

    pub fn many_to_ones(&self) -> impl Iterator<Item = (usize, &PropertyMapping)> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p.kind, PropertyKind::ManyToOne { .. }))
    }

    pub fn has_collections(&self) -> bool {
        self.properties.iter().any(PropertyMapping::is_collection)
    }
}

/// Fluent construction of EntityMetadata
pub struct EntityMetadataBuilder {
    name: String,
    table: String,
    id: IdMapping,
    properties: Vec<PropertyMapping>,
    version: Option<String>,
    dynamic_update: bool,
    mutable: bool,
    cacheable: bool,
}

impl EntityMetadataBuilder {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            id: IdMapping {
                column: "id".to_string(),
                sql_type: SqlType::Integer,
                strategy: IdStrategy::Increment,
            },
            properties: Vec::new(),
            version: None,
            dynamic_update: false,
            mutable: true,
            cacheable: false,
        }
    }

    pub fn id(mut self, column: &str, sql_type: SqlType, strategy: IdStrategy) -> Self {
        self.id = IdMapping {
            column: column.to_string(),
            sql_type,
            strategy,
        };
        self
    }

    pub fn property(mut self, property: PropertyMapping) -> Self {
        self.properties.push(property);
        self
    }

    pub fn basic(self, name: &str, sql_type: SqlType) -> Self {
        self.property(PropertyMapping::basic(name, sql_type))
    }

    /// Integer property used for optimistic locking
    pub fn version(mut self, name: &str) -> Self {
        self.version = Some(name.to_string());
        self.property(PropertyMapping::basic(name, SqlType::Integer).not_null())
    }

    /// Only changed columns are written by updates
    pub fn dynamic_update(mut self) -> Self {
        self.dynamic_update = true;
        self
    }

    /// Instances are never dirty-checked or updated
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn build(self) -> AppResult<EntityMetadata> {
        validate_identifier("entity", &self.name)?;
        validate_identifier("table", &self.table)?;
        validate_identifier("column", &self.id.column)?;

        for (i, property) in self.properties.iter().enumerate() {
            if self.properties[..i].iter().any(|p| p.name == property.name) {
                return Err(AppError::MappingError(format!(
                    "Duplicate property '{}' on entity '{}'",
                    property.name, self.name
                )));
            }
            if let Some(column) = &property.column {
                validate_identifier("column", column)?;
            }
            if let PropertyKind::Collection(mapping) = &property.kind {
                match &mapping.kind {
                    CollectionKind::OneToMany { key_column, .. } => {
                        validate_identifier("column", key_column)?
                    }
                    CollectionKind::ManyToMany {
                        join_table,
                        key_column,
                        element_column,
                    } => {
                        validate_identifier("table", join_table)?;
                        validate_identifier("column", key_column)?;
                        validate_identifier("column", element_column)?;
                    }
                }
            }
        }

        let version = match &self.version {
            Some(name) => Some(
                self.properties
                    .iter()
                    .position(|p| &p.name == name)
                    .ok_or_else(|| {
                        AppError::MappingError(format!("Unknown version property '{}'", name))
                    })?,
            ),
            None => None,
        };

        Ok(EntityMetadata {
            name: self.name,
            table: self.table,
            id: self.id,
            properties: self.properties,
            version,
            dynamic_update: self.dynamic_update,
            mutable: self.mutable,
            cacheable: self.cacheable,
        })
    }
}
