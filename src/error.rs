use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    DatabaseError(String),
    MappingError(String),
    ObjectNotFound(String),
    // Lifecycle violations
    TransientObject(String),
    TransientPropertyValue(String),
    PersistentObject(String),
    NonUniqueObject(String),
    InvalidArgument(String),
    SessionClosed,
    // Concurrency control
    StaleObjectState { entity: String, id: String },
    StaleState(String),
    TransactionError(String),
    Validation(String),
    CacheError(String),
    SerializationError(String),
    DeserializationError(String),
    ConfigurationError(String),
    IdGenerationError(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppError::MappingError(msg) => write!(f, "Mapping error: {}", msg),
            AppError::ObjectNotFound(msg) => write!(f, "No row with the given identifier exists: {}", msg),
            AppError::TransientObject(msg) => {
                write!(f, "Object references an unsaved transient instance: {}", msg)
            }
            AppError::TransientPropertyValue(msg) => {
                write!(f, "Not-null property references a transient value: {}", msg)
            }
            AppError::PersistentObject(msg) => write!(f, "Detached entity passed to persist: {}", msg),
            AppError::NonUniqueObject(msg) => write!(
                f,
                "A different object with the same identifier value was already associated with the session: {}",
                msg
            ),
            AppError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            AppError::SessionClosed => write!(f, "Session is closed"),
            AppError::StaleObjectState { entity, id } => write!(
                f,
                "Row was updated or deleted by another transaction: {}#{}",
                entity, id
            ),
            AppError::StaleState(msg) => write!(f, "Unexpected row count: {}", msg),
            AppError::TransactionError(msg) => write!(f, "Transaction error: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::CacheError(msg) => write!(f, "Cache error: {}", msg),
            AppError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppError::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            AppError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::IdGenerationError(msg) => write!(f, "ID generation error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// True for optimistic-locking failures raised while flushing
    pub fn is_stale(&self) -> bool {
        matches!(self, AppError::StaleObjectState { .. } | AppError::StaleState(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::ObjectNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::InvalidArgument(_) | AppError::Validation(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::StaleObjectState { .. } | AppError::StaleState(_) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            AppError::SessionClosed => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

impl From<bincode::Error> for AppError {
    fn from(err: bincode::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
