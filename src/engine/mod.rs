// Engine - session, persistence context, action queue and flush
pub mod action_queue;          // Ordered pending actions and insert sorting
pub mod actions;               // Insert, update, delete and collection actions
pub mod dirty_check;           // Snapshot comparison
pub mod entity_entry;          // Per-instance bookkeeping
pub mod listeners;             // Lifecycle event listeners
pub mod persistence_context;   // Identity map and collection snapshots
pub mod query;                 // Typed criteria queries
pub mod second_level_cache;    // Disassembled cache entries
pub mod session;               // Unit of work
pub mod session_factory;       // Shared session configuration
pub mod sql;                   // Statement generation

mod cascade;
mod flush;
mod foreign_keys;
mod loader;
mod merge;

pub use listeners::{veto, EntityEvent, EntityListener, ListenerContext, ListenerRegistry, TimestampListener};
pub use query::{Predicate, Query};
pub use session::Session;
pub use session_factory::{SchemaAction, SessionFactory, SessionFactoryBuilder, SessionFactoryConfig};
