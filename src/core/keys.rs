// Keys - database identity and object identity of managed instances

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::value::Identifier;

/// Database identity: entity name plus identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_name: String,
    pub id: Identifier,
}

impl EntityKey {
    pub fn new(entity_name: impl Into<String>, id: impl Into<Identifier>) -> Self {
        Self {
            entity_name: entity_name.into(),
            id: id.into(),
        }
    }

    /// Key used for second-level cache regions
    pub fn cache_key(&self) -> String {
        format!("{}#{}", self.entity_name, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.id)
    }
}

/// Object identity: the address of a shared instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:x}", self.0)
    }
}

/// A collection is identified by its owning instance and property position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionKey {
    pub owner: InstanceId,
    pub property: usize,
}

impl CollectionKey {
    pub fn new(owner: InstanceId, property: usize) -> Self {
        Self { owner, property }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_formatting() {
        let key = EntityKey::new("Author", 12);
        assert_eq!(key.to_string(), "Author#12");
        assert_eq!(key.cache_key(), "Author#12");
        assert_eq!(key, EntityKey::new("Author", Identifier::Integer(12)));
    }

    #[test]
    fn test_entity_key_ordering() {
        let mut keys = vec![
            EntityKey::new("Book", 2),
            EntityKey::new("Author", 9),
            EntityKey::new("Book", 1),
        ];
        keys.sort();
        assert_eq!(keys[0].entity_name, "Author");
        assert_eq!(keys[1].id, Identifier::Integer(1));
    }
}
