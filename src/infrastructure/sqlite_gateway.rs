use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row as _, Transaction, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::infrastructure::gateway::{ExecuteResult, Row, SqlValue, Statement};
use crate::infrastructure::traits::{ConnectionProvider, SqlGateway};

/// Pool of SQLite connections; every session takes its own gateway
#[derive(Clone)]
pub struct SqliteConnectionProvider {
    pool: SqlitePool,
}

impl SqliteConnectionProvider {
    pub async fn connect(url: &str, max_connections: u32) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| AppError::ConfigurationError(format!("Invalid database url {}: {}", url, e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Connections are never recycled so an in-memory database survives for the pool's lifetime
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| {
                AppError::DatabaseError(format!("Failed to connect to SQLite at {}: {}", url, e))
            })?;

        info!("Connected to SQLite at {} (max {} connections)", url, max_connections);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ConnectionProvider for SqliteConnectionProvider {
    async fn acquire(&self) -> AppResult<Box<dyn SqlGateway>> {
        Ok(Box::new(SqliteGateway {
            pool: self.pool.clone(),
            tx: None,
        }))
    }

    async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Gateway for one session. Outside a transaction statements run in
/// autocommit mode against the pool.
pub struct SqliteGateway {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param.clone() {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(v) => query.bind(v),
            SqlValue::Real(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::Blob(v) => query.bind(v),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> AppResult<Row> {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut values = Vec::with_capacity(columns.len());

    for index in 0..columns.len() {
        let raw = row
            .try_get_raw(index)
            .map_err(|e| AppError::DatabaseError(format!("Failed to read column {}: {}", index, e)))?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_string();
        let value = match type_name.as_str() {
            "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get::<i64, _>(index)?),
            "REAL" => SqlValue::Real(row.try_get::<f64, _>(index)?),
            "BLOB" => SqlValue::Blob(row.try_get::<Vec<u8>, _>(index)?),
            _ => SqlValue::Text(row.try_get::<String, _>(index)?),
        };
        values.push(value);
    }

    Ok(Row::new(columns, values))
}

#[async_trait]
impl SqlGateway for SqliteGateway {
    async fn execute(&mut self, statement: &Statement) -> AppResult<ExecuteResult> {
        debug!(sql = %statement.sql, params = statement.params.len(), "execute");
        let query = bind_params(sqlx::query(&statement.sql), &statement.params);
        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        }
        .map_err(|e| AppError::DatabaseError(format!("{}: {}", statement.sql, e)))?;

        Ok(ExecuteResult {
            rows_affected: result.rows_affected(),
            last_insert_id: Some(result.last_insert_rowid()),
        })
    }

    async fn query(&mut self, statement: &Statement) -> AppResult<Vec<Row>> {
        debug!(sql = %statement.sql, params = statement.params.len(), "query");
        let query = bind_params(sqlx::query(&statement.sql), &statement.params);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await,
            None => query.fetch_all(&self.pool).await,
        }
        .map_err(|e| AppError::DatabaseError(format!("{}: {}", statement.sql, e)))?;

        rows.iter().map(decode_row).collect()
    }

    async fn begin(&mut self) -> AppResult<()> {
        if self.tx.is_some() {
            return Err(AppError::TransactionError(
                "Transaction already in progress".to_string(),
            ));
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to begin transaction: {}", e)))?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::TransactionError("No transaction in progress".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit transaction: {}", e)))
    }

    async fn rollback(&mut self) -> AppResult<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        tx.rollback()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to rollback transaction: {}", e)))
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }
}
