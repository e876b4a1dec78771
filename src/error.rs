//! Crate error type and its HTTP rendering.

use crate::config::ConfigError;
use crate::files::FileError;
use crate::identity::AuthError;
use crate::metadata::MetadataError;
use crate::sandbox::{RuntimeError, SandboxError};
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller may not work in this project.
    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// Another user holds the resource.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Sandbox(SandboxError::InvalidProject(_)) => StatusCode::BAD_REQUEST,
            Error::File(FileError::InvalidPath(_)) => StatusCode::BAD_REQUEST,
            Error::File(FileError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::File(FileError::AlreadyExists(_)) => StatusCode::CONFLICT,
            Error::Store(_) | Error::Sandbox(_) | Error::Runtime(_) | Error::Metadata(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Config(_) | Error::File(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = serde_json::json!({
            "success": false,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
