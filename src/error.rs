//! Request-level error taxonomy.
//!
//! Every handler returns `Result<_, AppError>`; the `IntoResponse` impl maps
//! the variants onto the status codes the original Vercel functions used and
//! keeps their `{error, details}` JSON body shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or invalid request field.
    #[error("{0}")]
    Validation(String),

    /// A referenced document does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Rejected order-status transition.
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization error: {e}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            AppError::InvalidTransition(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::Database(_) | AppError::Internal(_) => {
                // Handler-level failures get a generic message plus detail,
                // like the original's catch-all 500 responses.
                error!("request failed: {self}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = match &self {
            AppError::Database(_) | AppError::Internal(_) => {
                json!({ "error": message, "details": self.to_string() })
            }
            _ => json!({ "error": message }),
        };

        (status, Json(body)).into_response()
    }
}
