//! Unified error types for the data layer and the HTTP boundary.
//!
//! Mirrors the teacher's `DataError`: backend-tagged variants wrapping
//! `sqlx::Error`, plus a small set of domain errors, each carrying enough
//! context to map to the HTTP status codes in the external interface
//! contract without the handler needing to inspect internals.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors from the storage engine. `Sqlite` and `Postgres` are kept as
/// separate, deliberately non-`#[from]` variants (a bare `?` against
/// `sqlx::Error` cannot disambiguate which backend raised it) so a
/// Postgres failure is never mislabeled as a SQLite one and vice versa.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(sqlx::Error),

    #[error("Postgres error: {0}")]
    Postgres(sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found")]
    NotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn sqlite(err: sqlx::Error) -> Self {
        Self::Sqlite(err)
    }

    pub fn postgres(err: sqlx::Error) -> Self {
        Self::Postgres(err)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Sqlite(_) | Self::Postgres(_) | Self::Io(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Error type returned from axum handlers; renders as a free-text body
/// per spec §7 ("JSON errors use a free-text body string, non-normative").
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = e.status_code();
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(status = %self.status, message = %self.message, "request failed");
        (self.status, self.message).into_response()
    }
}
