// Statement log - decorators that record every statement a session sends
// Wraps any ConnectionProvider; used by the admin surface and by tests asserting flush order

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::AppResult;
use crate::infrastructure::gateway::{ExecuteResult, Row, Statement};
use crate::infrastructure::traits::{ConnectionProvider, SqlGateway};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedStatement {
    pub sql: String,
    pub space: String,
}

impl LoggedStatement {
    /// "insert authors", "update books", ...
    pub fn summary(&self) -> String {
        let verb = self
            .sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        format!("{} {}", verb, self.space)
    }
}

/// Shared, append-only record of executed statements
#[derive(Debug, Clone, Default)]
pub struct StatementLog {
    entries: Arc<Mutex<Vec<LoggedStatement>>>,
}

impl StatementLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, statement: &Statement) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LoggedStatement {
                sql: statement.sql.clone(),
                space: statement.space.clone(),
            });
    }

    pub fn statements(&self) -> Vec<LoggedStatement> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Summaries of data-changing statements only
    pub fn summary(&self) -> Vec<String> {
        self.statements()
            .iter()
            .filter(|s| !s.sql.trim_start().to_ascii_uppercase().starts_with("SELECT"))
            .map(LoggedStatement::summary)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Gateway decorator recording statements before delegating
pub struct LoggingGateway {
    inner: Box<dyn SqlGateway>,
    log: StatementLog,
}

impl LoggingGateway {
    pub fn new(inner: Box<dyn SqlGateway>, log: StatementLog) -> Self {
        Self { inner, log }
    }
}

#[async_trait]
impl SqlGateway for LoggingGateway {
    async fn execute(&mut self, statement: &Statement) -> AppResult<ExecuteResult> {
        self.log.record(statement);
        self.inner.execute(statement).await
    }

    async fn query(&mut self, statement: &Statement) -> AppResult<Vec<Row>> {
        self.log.record(statement);
        self.inner.query(statement).await
    }

    async fn begin(&mut self) -> AppResult<()> {
        self.inner.begin().await
    }

    async fn commit(&mut self) -> AppResult<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> AppResult<()> {
        self.inner.rollback().await
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }
}

/// Provider decorator handing out logging gateways that share one log
pub struct LoggingConnectionProvider {
    inner: Arc<dyn ConnectionProvider>,
    log: StatementLog,
}

impl LoggingConnectionProvider {
    pub fn new(inner: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            inner,
            log: StatementLog::new(),
        }
    }

    pub fn log(&self) -> StatementLog {
        self.log.clone()
    }
}

#[async_trait]
impl ConnectionProvider for LoggingConnectionProvider {
    async fn acquire(&self) -> AppResult<Box<dyn SqlGateway>> {
        let gateway = self.inner.acquire().await?;
        Ok(Box::new(LoggingGateway::new(gateway, self.log.clone())))
    }

    async fn health_check(&self) -> AppResult<()> {
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_skips_selects() {
        let log = StatementLog::new();
        log.record(&Statement::new("SELECT id FROM authors WHERE id = ?", "authors"));
        log.record(&Statement::new("INSERT INTO authors (id) VALUES (?)", "authors"));
        log.record(&Statement::new("DELETE FROM book_tags WHERE book_id = ?", "book_tags"));

        assert_eq!(log.len(), 3);
        assert_eq!(log.summary(), vec!["insert authors", "delete book_tags"]);

        log.clear();
        assert!(log.is_empty());
    }
}
