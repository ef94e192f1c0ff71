//! Unified error handling
//!
//! `MarketError` is the error every marketplace operation returns. It maps
//! onto a consistent JSON error body when it crosses the HTTP boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Transient(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl MarketError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        Self::IllegalTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(anyhow::anyhow!(msg.into()))
    }

    /// Whether the failure says nothing about the state of the store.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::IllegalTransition(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthenticated(_) => "UNAUTHORIZED",
            Self::Authorization(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::IllegalTransition(_) => "ILLEGAL_TRANSITION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Transient(_) => "TRANSIENT_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::Validation(msg)
            | Self::Unauthenticated(msg)
            | Self::Authorization(msg)
            | Self::Conflict(msg)
            | Self::IllegalTransition(msg)
            | Self::NotFound(msg) => msg.clone(),
            Self::Transient(_) => "The store is temporarily unavailable, please retry".to_string(),
            // Don't leak internal error details
            Self::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<StoreError> for MarketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::Denied(msg) => Self::Authorization(msg),
            StoreError::Unavailable(msg) => Self::Transient(msg),
            StoreError::Invalid(msg) => Self::Internal(anyhow::anyhow!("invalid row: {msg}")),
            StoreError::Backend(e) => Self::Internal(e),
        }
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(anyhow::Error::new(err).context("row (de)serialization failed"))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for MarketError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(e) => {
                tracing::error!(error = ?e, "Internal server error");
            }
            Self::Transient(msg) => {
                tracing::error!(error = %msg, "Store unavailable");
            }
            _ => {
                tracing::warn!(error = %self, "API error");
            }
        }

        let status = self.status_code();
        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.public_message(),
            request_id: None,
        };

        (status, Json(body)).into_response()
    }
}

pub type MarketResult<T> = Result<T, MarketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_category() {
        let err: MarketError = StoreError::Conflict("bid is not pending".into()).into();
        assert!(matches!(err, MarketError::Conflict(_)));

        let err: MarketError = StoreError::Unavailable("connection reset".into()).into();
        assert!(err.is_transient());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_details_are_not_public() {
        let err = MarketError::internal("password=hunter2");
        assert_eq!(err.public_message(), "An internal error occurred");
    }
}
