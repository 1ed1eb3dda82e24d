// Unit of Work - session-scoped persistence engine over SQL

// Core types and primitives
pub mod core;

// Mapping layer - entity contract and metadata
pub mod mapping;

// Infrastructure - connections, cache regions, id generators and statistics
pub mod infrastructure;

// Engine - sessions, persistence context, action queue and flushing
pub mod engine;

// Domain models
pub mod domains;

// Common utilities
pub mod admin;
pub mod config;
pub mod data_seeder;
pub mod error;

// Re-exports for convenience
pub use crate::core::{EntityStatus, FlushMode, Identifier, LockMode, Value};
pub use engine::{Query, Session, SessionFactory, SessionFactoryConfig};
pub use error::{AppError, AppResult};
pub use mapping::{Entity, EntityRef, EntityState, Metamodel};
