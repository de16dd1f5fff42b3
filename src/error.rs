use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::db::StoreError;
use crate::services::gateway::GatewayError;

/// Failures of a single revoke or restore operation.
#[derive(Error, Debug)]
pub enum UnverifyError {
    #[error("No marker role configured for guild {0}")]
    Configuration(i64),

    #[error("Member {user_id} is already unverified in guild {guild_id}")]
    AlreadyUnverified { guild_id: i64, user_id: i64 },

    #[error("End time {0} is in the past")]
    InvalidEndTime(DateTime<Utc>),

    #[error("Missing permissions: {0}")]
    PermissionDenied(String),

    #[error("{0} no longer exists")]
    EntityGone(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Guild gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Role,
    Channel,
    Member,
}

/// A single side effect that was skipped. Collected, logged and reported;
/// never aborts the surrounding operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    PermissionDenied { target: Target, id: i64 },
    EntityGone { target: Target, id: i64 },
    Gateway { target: Target, id: i64, message: String },
}

impl Warning {
    pub fn from_gateway(target: Target, id: i64, error: &GatewayError) -> Self {
        let warning = match error {
            GatewayError::PermissionDenied => Warning::PermissionDenied { target, id },
            GatewayError::NotFound => Warning::EntityGone { target, id },
            other => Warning::Gateway {
                target,
                id,
                message: other.to_string(),
            },
        };
        tracing::warn!(?warning, "Skipped change");
        warning
    }

    pub fn entity_gone(target: Target, id: i64) -> Self {
        let warning = Warning::EntityGone { target, id };
        tracing::warn!(?warning, "Skipped change");
        warning
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Unverify(#[from] UnverifyError),

    #[error("Database error: {0}")]
    Database(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_debug = format!("{:?}", self);

        let (status, error_message) = match self {
            AppError::Unverify(e) => match e {
                UnverifyError::Configuration(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                UnverifyError::AlreadyUnverified { .. } => (StatusCode::CONFLICT, e.to_string()),
                UnverifyError::InvalidEndTime(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
                }
                UnverifyError::PermissionDenied(_) => (StatusCode::FORBIDDEN, e.to_string()),
                UnverifyError::EntityGone(_) => (StatusCode::NOT_FOUND, e.to_string()),
                UnverifyError::Store(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Record could not be created".to_string(),
                ),
                UnverifyError::Gateway(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            },
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests, try again later".to_string(),
            ),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": error_debug,
            "message": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
