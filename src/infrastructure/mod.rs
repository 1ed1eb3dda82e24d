// Core infrastructure modules
pub mod cache;                 // LRU second-level cache regions
pub mod gateway;               // Statement, row and parameter types
pub mod id_generator;          // Snowflake, increment and UUID identifiers
pub mod sqlite_gateway;        // SQLite connection provider and gateway
pub mod statement_log;         // Statement recording decorators
pub mod statistics;            // Session factory counters
pub mod traits;                // Infrastructure traits

// Re-export core infrastructure components
pub use cache::{LruCacheRegion, LruRegionFactory};
pub use gateway::{ExecuteResult, Row, SqlValue, Statement};
pub use id_generator::{IncrementGenerator, SnowflakeGenerator};
pub use sqlite_gateway::{SqliteConnectionProvider, SqliteGateway};
pub use statement_log::{LoggedStatement, LoggingConnectionProvider, StatementLog};
pub use statistics::{Statistics, StatisticsSnapshot};
pub use traits::{CacheRegion, ConnectionProvider, RegionFactory, SqlGateway};
