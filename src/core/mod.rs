// Core types and primitives
pub mod keys;
pub mod status;
pub mod value;

pub use keys::{CollectionKey, EntityKey, InstanceId};
pub use status::{EntityStatus, FlushMode, LockMode};
pub use value::{Identifier, Value};
