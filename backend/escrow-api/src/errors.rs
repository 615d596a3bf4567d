//! Application-wide error types and their HTTP mapping.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::error::ErrorKind;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Invalid state transition: {entity} cannot move from {from} to {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            Self::Conflict(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Provider(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Migrate(_) | Self::Config(_) | Self::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable kind, returned alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Provider(_) | Self::Http(_) => "provider_error",
            Self::Database(_) | Self::Migrate(_) | Self::Config(_) | Self::Metrics(_) => {
                "internal_error"
            }
        }
    }
}

/// Storage constraint violations become domain errors: uniqueness is a
/// conflict, foreign-key / check / not-null failures are bad input.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        let classified = match &err {
            sqlx::Error::RowNotFound => return Self::NotFound("Record".to_string()),
            sqlx::Error::Database(db) => Some((db.kind(), constraint_target(db.message()))),
            _ => None,
        };

        match classified {
            Some((ErrorKind::UniqueViolation, target)) => {
                Self::Conflict(format!("duplicate value for {target}"))
            }
            Some((ErrorKind::ForeignKeyViolation, _)) => {
                Self::Validation("referenced record does not exist".to_string())
            }
            Some((ErrorKind::CheckViolation | ErrorKind::NotNullViolation, target)) => {
                Self::Validation(format!("invalid value for {target}"))
            }
            _ => Self::Database(err),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

/// SQLite reports e.g. `UNIQUE constraint failed: users.email`; keep only
/// the column list so storage wording never reaches the client.
fn constraint_target(message: &str) -> String {
    message
        .rsplit_once(": ")
        .map(|(_, target)| target.to_string())
        .unwrap_or_else(|| "constrained field".to_string())
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, code = self.code(), "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: self.code(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_documented_statuses() {
        let insufficient = AppError::InsufficientFunds {
            requested: Decimal::new(30, 0),
            available: Decimal::new(20, 0),
        };
        assert_eq!(insufficient.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::invalid_transition("hold", "captured", "active").status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::NotFound("Hold 7".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Conflict("dup".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn row_not_found_becomes_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn constraint_target_strips_storage_prefix() {
        assert_eq!(
            constraint_target("UNIQUE constraint failed: users.email"),
            "users.email"
        );
        assert_eq!(constraint_target("weird"), "constrained field");
    }

    #[test]
    fn internal_errors_hide_details() {
        let response = AppError::Config("secret path".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
