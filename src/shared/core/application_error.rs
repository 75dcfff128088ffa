// Application errors shared by the inbound adapters.
//
// Responsibilities
// - Collapse port and access errors into the categories callers act on.
// - Map each category to an HTTP status and a JSON error body, and to a GraphQL error.

use async_graphql::ErrorExtensions;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::modules::access::core::access_guard::DenyReason;
use crate::modules::access::core::token_verifier::TokenError;
use crate::shared::infrastructure::change_outbox::OutboxError;
use crate::shared::infrastructure::listing_store::StoreError;
use crate::shared::infrastructure::search_index::SearchIndexError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] TokenError),

    #[error("forbidden: {0}")]
    Forbidden(#[from] DenyReason),

    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("conflicting state: {0}")]
    InvalidState(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl From<StoreError> for ApplicationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { expected, actual } => {
                ApplicationError::VersionConflict { expected, actual }
            }
            StoreError::NotFound(listing_id) => ApplicationError::NotFound(format!("listing {listing_id}")),
            StoreError::Invalid(reason) => ApplicationError::Invalid(reason),
            StoreError::Backend(reason) => ApplicationError::Unexpected(reason),
        }
    }
}

impl From<OutboxError> for ApplicationError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::NotFound(sequence) => ApplicationError::NotFound(format!("outbox event {sequence}")),
            err @ OutboxError::InvalidState { .. } => ApplicationError::InvalidState(err.to_string()),
            OutboxError::Backend(reason) => ApplicationError::Unexpected(reason),
        }
    }
}

impl From<SearchIndexError> for ApplicationError {
    fn from(err: SearchIndexError) -> Self {
        ApplicationError::Unavailable(err.to_string())
    }
}

impl ApplicationError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApplicationError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApplicationError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApplicationError::VersionConflict { .. } | ApplicationError::InvalidState(_) => {
                StatusCode::CONFLICT
            }
            ApplicationError::NotFound(_) => StatusCode::NOT_FOUND,
            ApplicationError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApplicationError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApplicationError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({
        "error": {
            "code": status.as_u16(),
            "message": message.into(),
        }
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for ApplicationError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        error_response(status, self.to_string())
    }
}

impl ApplicationError {
    /// A GraphQL error carrying the HTTP status as its `code` extension.
    pub fn into_graphql(self) -> async_graphql::Error {
        let status = i32::from(self.status().as_u16());
        async_graphql::Error::new(self.to_string()).extend_with(|_, extensions| extensions.set("code", status))
    }
}
