use crate::core::{EntityKey, EntityStatus, Identifier, LockMode};
use crate::mapping::{EntityLink, EntityState};

/// Bookkeeping for one instance associated with a session
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub status: EntityStatus,
    pub entity_name: &'static str,
    pub id: Option<Identifier>,
    /// Snapshot taken at load, insert or last flush; None while read-only
    pub loaded_state: Option<EntityState>,
    /// Loaded state with references to deleted entities nulled out
    pub deleted_state: Option<EntityState>,
    pub version: Option<i64>,
    pub exists_in_database: bool,
    pub lock_mode: LockMode,
    pub link: EntityLink,
}

impl EntityEntry {
    pub fn new(link: EntityLink, status: EntityStatus) -> Self {
        Self {
            status,
            entity_name: link.entity_name(),
            id: link.identifier(),
            loaded_state: None,
            deleted_state: None,
            version: None,
            exists_in_database: false,
            lock_mode: LockMode::None,
            link,
        }
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id
            .as_ref()
            .map(|id| EntityKey::new(self.entity_name, id.clone()))
    }

    pub fn is_read_only(&self) -> bool {
        self.status == EntityStatus::ReadOnly
    }
}
