//! Application error taxonomy and HTTP mapping.
//!
//! Domain errors carry enough context to render the exact response the
//! clients expect; infrastructure errors (gateway, database) are logged in
//! full but their messages are replaced with a generic one outside
//! development.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::OnceLock;
use tracing::error;

use crate::database::error::DatabaseError;
use crate::database::payment_repository::Payment;
use crate::payments::gateway::GatewayError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Bad request input or an order in a state that cannot be charged.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    /// Duplicate completed payment or an invalid cancel. May carry the
    /// conflicting record so the client can show what was already paid.
    #[error("{message}")]
    Conflict {
        message: String,
        payment: Option<Box<Payment>>,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        AppError::Conflict {
            message: message.into(),
            payment: None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Conflict { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Gateway(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

static EXPOSE_DETAILS: OnceLock<bool> = OnceLock::new();

/// Record the runtime environment once at startup. Detailed gateway and
/// database messages are only exposed in development.
pub fn set_environment(environment: &str) {
    let _ = EXPOSE_DETAILS.set(environment == "development");
}

fn expose_details() -> bool {
    *EXPOSE_DETAILS.get_or_init(|| true)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            AppError::Gateway(e) => {
                error!("payment gateway error: {e}");
                if expose_details() {
                    format!("Error initiating payment: {e}")
                } else {
                    "Payment service temporarily unavailable".to_string()
                }
            }
            AppError::Database(e) => {
                error!("database error: {e}");
                if expose_details() {
                    e.to_string()
                } else {
                    "Internal server error".to_string()
                }
            }
            AppError::Internal(e) => {
                error!("internal error: {e}");
                if expose_details() {
                    e.clone()
                } else {
                    "Internal server error".to_string()
                }
            }
            other => other.to_string(),
        };

        let body = match self {
            AppError::Conflict {
                payment: Some(payment),
                ..
            } => json!({ "message": message, "payment": payment }),
            _ => json!({ "message": message }),
        };

        (status, Json(body)).into_response()
    }
}
