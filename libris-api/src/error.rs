//! Error types for the API instance.
//!
//! Every failure a client can observe maps to a status code plus a
//! `{error, detail}` body, where `error` is a stable kind tag. Internal
//! error types never leak beyond the detail string.

use axum::{
    extract::rejection::JsonRejection,
    extract::{FromRequest, Request},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::db::DbError;

/// API error surface.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed input or a reference to an unknown user/book.
    #[error("{0}")]
    Validation(String),

    /// Lookup target does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Unique-key collision (duplicate ISBN or user id).
    #[error("{0}")]
    Conflict(String),

    /// Reservation queue is at capacity; retry after the next batch.
    #[error("reservation queue is full")]
    QueueFull { retry_after_secs: u64 },

    /// No pooled connection became available within the timeout.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Database failure not attributable to the request.
    #[error("database error: {0}")]
    Database(String),
}

impl ApiError {
    /// Stable kind tag used in logs and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::QueueFull { .. } => "queue_full",
            ApiError::PoolExhausted => "pool_exhausted",
            ApiError::Database(_) => "database",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::QueueFull { .. } | ApiError::PoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::PoolExhausted => ApiError::PoolExhausted,
            other => ApiError::Database(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), detail = %self, "request failed");
        } else {
            tracing::debug!(kind = self.kind(), detail = %self, "request rejected");
        }

        let body = Json(json!({
            "error": self.kind(),
            "detail": self.to_string(),
        }));

        match self {
            ApiError::QueueFull { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// `Json` extractor that reports malformed bodies as 400 validation
/// errors instead of axum's default 422.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::Validation(rejection.body_text())),
        }
    }
}
