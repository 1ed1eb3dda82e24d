// Second-level cache entries - disassembled entity state shared across sessions
// References and collection elements are stored as identifiers and reassembled on load

use serde::{Deserialize, Serialize};

use crate::core::{Identifier, Value};
use crate::error::{AppError, AppResult};
use crate::mapping::{EntityMetadata, EntityState, PropertyKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// RFC 3339 text, the same form the database holds
    Timestamp(String),
    Reference(Identifier),
    Collection(Vec<Identifier>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: Option<i64>,
    pub state: Vec<CachedValue>,
}

impl CacheEntry {
    pub fn disassemble(meta: &EntityMetadata, version: Option<i64>, state: &EntityState) -> AppResult<Self> {
        let mut values = Vec::with_capacity(meta.properties.len());
        for (index, property) in meta.properties.iter().enumerate() {
            let value = state.get(index);
            let cached = match (&property.kind, value) {
                (_, Value::Null) => CachedValue::Null,
                (PropertyKind::ManyToOne { .. }, Value::Reference(link)) => {
                    match link.identifier() {
                        Some(id) => CachedValue::Reference(id),
                        None => {
                            return Err(AppError::CacheError(format!(
                                "{}.{} references an unsaved instance",
                                meta.name, property.name
                            )))
                        }
                    }
                }
                (PropertyKind::Collection(_), Value::Collection(links)) => {
                    let ids = links
                        .iter()
                        .map(|l| l.identifier())
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| {
                            AppError::CacheError(format!(
                                "{}.{} holds an unsaved element",
                                meta.name, property.name
                            ))
                        })?;
                    CachedValue::Collection(ids)
                }
                (_, Value::Boolean(v)) => CachedValue::Boolean(*v),
                (_, Value::Integer(v)) => CachedValue::Integer(*v),
                (_, Value::Real(v)) => CachedValue::Real(*v),
                (_, Value::Text(v)) => CachedValue::Text(v.clone()),
                (_, Value::Blob(v)) => CachedValue::Blob(v.clone()),
                (_, Value::Timestamp(v)) => {
                    CachedValue::Timestamp(crate::engine::sql::format_timestamp(v))
                }
                (_, other) => {
                    return Err(AppError::CacheError(format!(
                        "Unexpected {} value for {}.{}",
                        other.type_name(),
                        meta.name,
                        property.name
                    )))
                }
            };
            values.push(cached);
        }
        Ok(Self {
            version,
            state: values,
        })
    }

    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| AppError::SerializationError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        bincode::deserialize(bytes).map_err(|e| AppError::DeserializationError(e.to_string()))
    }

    /// Basic values become property values; associations are left to the caller
    pub fn basic_value(value: &CachedValue) -> AppResult<Option<Value>> {
        Ok(match value {
            CachedValue::Null => Some(Value::Null),
            CachedValue::Boolean(v) => Some(Value::Boolean(*v)),
            CachedValue::Integer(v) => Some(Value::Integer(*v)),
            CachedValue::Real(v) => Some(Value::Real(*v)),
            CachedValue::Text(v) => Some(Value::Text(v.clone())),
            CachedValue::Blob(v) => Some(Value::Blob(v.clone())),
            CachedValue::Timestamp(v) => Some(Value::Timestamp(crate::engine::sql::parse_timestamp(v)?)),
            CachedValue::Reference(_) | CachedValue::Collection(_) => None,
        })
    }
}
