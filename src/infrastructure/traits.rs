use crate::error::AppResult;
use crate::infrastructure::gateway::{ExecuteResult, Row, Statement};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Executes SQL on behalf of exactly one session
#[async_trait]
pub trait SqlGateway: Send {
    async fn execute(&mut self, statement: &Statement) -> AppResult<ExecuteResult>;
    async fn query(&mut self, statement: &Statement) -> AppResult<Vec<Row>>;
    async fn begin(&mut self) -> AppResult<()>;
    async fn commit(&mut self) -> AppResult<()>;
    async fn rollback(&mut self) -> AppResult<()>;
    fn in_transaction(&self) -> bool;
}

/// Hands out gateways to newly opened sessions
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> AppResult<Box<dyn SqlGateway>>;
    async fn health_check(&self) -> AppResult<()>;
}

/// A named second-level cache region storing opaque entries
#[async_trait]
pub trait CacheRegion: Send + Sync {
    fn name(&self) -> &str;
    async fn get(&self, key: &str) -> AppResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> AppResult<()>;
    async fn evict(&self, key: &str) -> AppResult<()>;
    async fn evict_all(&self) -> AppResult<()>;
    async fn len(&self) -> usize;
}

/// Builds one region per cacheable entity
pub trait RegionFactory: Send + Sync {
    fn build_region(&self, name: &str, ttl: Option<Duration>) -> Arc<dyn CacheRegion>;
}
