use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-specific error types.
///
/// The pipeline variants (`Authentication`, `Configuration`, `Upstream`,
/// `Transform`, `Persistence`) map one-to-one onto intake event outcomes;
/// the remaining variants are transport/infrastructure plumbing.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Database-related errors. Stored as the rendered message so the
    /// diagnostic survives cloning through context chains.
    DatabaseError(String),
    /// Signature/key mismatch — rejected at the edge, never persisted.
    Authentication(String),
    /// No matching or enabled mapping configuration.
    Configuration(String),
    /// Provider API failure: non-2xx, timeout, malformed response.
    Upstream(String),
    /// Single-field formatting failure. Logged, never fails a record.
    Transform(String),
    /// Destination record validation/insert failure.
    Persistence(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Resource not found error.
    NotFound(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream API error: {}", msg),
            AppError::Transform(msg) => write!(f, "Transform error: {}", msg),
            AppError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    /// Internal diagnostics stay in the logs, not in the response body.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::Authentication(msg) => {
                tracing::warn!("Authentication failure: {}", msg);
                (StatusCode::FORBIDDEN, "Forbidden".to_string())
            }
            AppError::Configuration(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Upstream(msg) => {
                tracing::error!("Upstream API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "Upstream provider error".to_string(),
                )
            }
            AppError::Transform(msg) => {
                // Transform failures degrade a single field; reaching the HTTP
                // boundary with one means a caller misused the mapper.
                tracing::error!("Transform error escaped the mapper: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Persistence(msg) => {
                tracing::error!("Persistence error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to persist record".to_string(),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Upstream(format!("Request timed out: {}", err))
        } else {
            AppError::Upstream(err.to_string())
        }
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: context.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_diagnostic_survives_clone() {
        let err = AppError::WithContext {
            source: Box::new(AppError::DatabaseError(
                "connection reset by peer".to_string(),
            )),
            context: "inserting lead".to_string(),
        };
        let rendered = err.clone().to_string();
        assert!(rendered.contains("inserting lead"));
        assert!(rendered.contains("connection reset by peer"));
    }
}
