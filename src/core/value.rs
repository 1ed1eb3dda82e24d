// Values - property values flowing between entity instances, snapshots and SQL
// References and collections keep the referenced instances so identity survives a flush

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::mapping::entity::{Entity, EntityLink, EntityRef};

/// Database identity of an entity row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    Integer(i64),
    Text(String),
}

impl Identifier {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Identifier::Integer(v) => Some(*v),
            Identifier::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Identifier::Text(v) => Some(v),
            Identifier::Integer(_) => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Integer(v) => write!(f, "{}", v),
            Identifier::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Identifier {
    fn from(id: i64) -> Self {
        Identifier::Integer(id)
    }
}

impl From<&str> for Identifier {
    fn from(id: &str) -> Self {
        Identifier::Text(id.to_string())
    }
}

impl From<String> for Identifier {
    fn from(id: String) -> Self {
        Identifier::Text(id)
    }
}

impl From<Uuid> for Identifier {
    fn from(id: Uuid) -> Self {
        Identifier::Text(id.to_string())
    }
}

/// A single property value of an entity state
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Timestamp(DateTime<Utc>),
    /// Many-to-one association
    Reference(EntityLink),
    /// Elements of a one-to-many or many-to-many association
    Collection(Vec<EntityLink>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Timestamp(_) => "timestamp",
            Value::Reference(_) => "reference",
            Value::Collection(_) => "collection",
        }
    }

    pub fn as_reference(&self) -> Option<&EntityLink> {
        match self {
            Value::Reference(link) => Some(link),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[EntityLink]> {
        match self {
            Value::Collection(links) => Some(links),
            _ => None,
        }
    }

    /// Build a collection value out of typed handles
    pub fn collection<T: Entity>(elements: &[EntityRef<T>]) -> Self {
        Value::Collection(elements.iter().map(EntityRef::link).collect())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a.same_entity(b),
            (Value::Collection(a), Value::Collection(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_entity(y))
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Identifier> for Value {
    fn from(id: Identifier) -> Self {
        match id {
            Identifier::Integer(v) => Value::Integer(v),
            Identifier::Text(v) => Value::Text(v),
        }
    }
}

impl<T: Entity> From<&EntityRef<T>> for Value {
    fn from(entity: &EntityRef<T>) -> Self {
        Value::Reference(entity.link())
    }
}

impl<T: Entity> From<&Vec<EntityRef<T>>> for Value {
    fn from(elements: &Vec<EntityRef<T>>) -> Self {
        Value::collection(elements)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
